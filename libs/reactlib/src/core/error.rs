// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Binding graph error: {0}")]
    Graph(String),

    #[error("Too few {kind}: wanted {wanted}, received {received}")]
    Arity {
        kind: &'static str,
        wanted: usize,
        received: usize,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Bound callable failed: {0}")]
    Invocation(String),

    #[error("Invocation cancelled: {0}")]
    Cancelled(String),

    #[error("Submission rejected, {0} is already pending")]
    Pending(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// Too few inputs supplied to a dispatch call.
    pub fn input_arity(wanted: usize, received: usize) -> Self {
        Self::Arity {
            kind: "inputs",
            wanted,
            received,
        }
    }

    /// Too few outputs returned by a bound callable.
    pub fn output_arity(wanted: usize, received: usize) -> Self {
        Self::Arity {
            kind: "outputs",
            wanted,
            received,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
