// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Transport configuration loaded from TOML.
//!
//! ```toml
//! queue_depth = 32
//! thread_stack_size = 262144
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::{Error, Result};

/// Default number of messages a channel buffers before `send` blocks.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/// Tunables shared by channels and unit threads.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Messages buffered per channel before `send` blocks. Must be at least 1.
    pub queue_depth: usize,
    /// Stack size for threads spawned by [`crate::Unit::spawn`]; platform default when unset.
    pub thread_stack_size: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { queue_depth: DEFAULT_QUEUE_DEPTH, thread_stack_size: None }
    }
}

impl TransportConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let config: Self = toml::from_str(data).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&data)
    }

    /// Rejects values the transport cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(Error::Config("queue_depth must be at least 1".into()));
        }
        if self.thread_stack_size == Some(0) {
            return Err(Error::Config("thread_stack_size must be non-zero".into()));
        }
        Ok(())
    }
}
