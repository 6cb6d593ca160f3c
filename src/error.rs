//! Error taxonomy shared across the generation and distribution paths
//!
//! None of these abort a reconciliation pass: transport, parse, and template
//! failures are isolated to their sub-step, adapt failures skip distribution
//! for one pass, and delivery failures leave the target eligible for retry.

use thiserror::Error;

/// Errors produced while generating or distributing configuration
#[derive(Debug, Error)]
pub enum Error {
    /// A remote Docker API call failed
    #[error("docker transport error: {0}")]
    Transport(#[from] bollard::errors::Error),

    /// Caddyfile text could not be parsed
    #[error("caddyfile parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A named template failed to compile or execute
    #[error("template {name:?}: {message}")]
    Template { name: String, message: String },

    /// Converting the Caddyfile into the wire payload failed
    #[error("config adapt error: {0}")]
    Adapt(String),

    /// Pushing configuration to a controlled server failed
    #[error("delivery to {server} failed: {message}")]
    Delivery { server: String, message: String },

    /// Local filesystem access failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Error::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn template(name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Template {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn delivery(server: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Delivery {
            server: server.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
