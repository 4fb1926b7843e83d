//! Fatal errors raised while a stack is being configured or built.
//!
//! Runtime problems inside a layer (timeouts, unreachable peers, malformed
//! headers) are handled in place and never surface here.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackError {
    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured listener bind address could not be resolved.
    #[error("Bind address {0} could not be resolved")]
    UnresolvableBindAddress(String),

    /// No listener could be opened.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A layer refused to start; the stack was not built.
    #[error("Layer {layer} failed to start: {source}")]
    LayerStart {
        layer: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, StackError>;
