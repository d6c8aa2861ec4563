//! Server configuration.

use crate::error::{Error, Result};
use serde::Deserialize;

/// Options consumed when a [`Server`](crate::Server) is constructed.
/// Immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Cap on simultaneously active calls. Unbounded when absent.
    #[serde(default)]
    pub max_concurrent_streams: Option<usize>,
}

impl ServerConfig {
    /// Configuration with an explicit stream cap.
    pub fn with_max_concurrent_streams(max: usize) -> Self {
        Self {
            max_concurrent_streams: Some(max),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_streams == Some(0) {
            return Err(Error::InvalidConfig(
                "max_concurrent_streams must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
