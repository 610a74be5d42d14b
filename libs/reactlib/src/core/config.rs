// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Engine configuration via `reactlib.yaml`.

use crate::core::error::{EngineError, Result};
use serde::Deserialize;
use std::path::Path;

/// Engine-wide settings from `reactlib.yaml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resolution of `concurrency_limit = "default"`.
    pub default_concurrency_limit: usize,
    /// Ceiling on concurrently running sync callables; absent is unbounded.
    pub max_workers: Option<usize>,
    /// Live sessions kept before least-recently-used eviction.
    pub session_capacity: usize,
    /// Default pacing between media chunk deliveries, in milliseconds.
    /// Zero disables pacing for bindings that don't set their own.
    pub stream_every_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency_limit: 1,
            max_workers: None,
            session_capacity: 1024,
            stream_every_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Configuration file name.
    pub const FILE_NAME: &'static str = "reactlib.yaml";

    /// Load configuration from a directory. Returns an error if the file is
    /// missing or cannot be parsed.
    pub fn load(dir: &Path) -> Result<Self> {
        let config_path = dir.join(Self::FILE_NAME);

        let content = std::fs::read_to_string(&config_path).map_err(|e| {
            EngineError::Config(format!("Failed to read {}: {}", config_path.display(), e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            EngineError::Config(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;

        tracing::info!("Loaded engine config from {}", config_path.display());
        Ok(config)
    }

    /// Load configuration from a directory, returning defaults if the file
    /// is missing or unparseable.
    pub fn load_or_default(dir: &Path) -> Self {
        let config_path = dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            tracing::debug!(
                "No {} found in {}, using defaults",
                Self::FILE_NAME,
                dir.display()
            );
            return Self::default();
        }

        match Self::load(dir) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }
}
