// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Engine settings that shape the frame pipeline.
//!
//! [`FrameConfig`] is supplied when a tracker is created.  Buffering depth and staging size can
//! also change at runtime through the tracker's `request_*` methods; those changes take effect
//! at the next `start_frame`.
//!
//! # Environment overrides
//!
//! [`FrameConfig::from_env`] overlays these variables on the defaults, which is handy for
//! tuning pool sizes without a rebuild:
//!
//! | Variable                | Field               |
//! |-------------------------|---------------------|
//! | `AAF_BUFFERING_DEPTH`   | `buffering_depth`   |
//! | `AAF_MAX_STAGING_BYTES` | `max_staging_bytes` |
//! | `AAF_FENCE_TIMEOUT_MS`  | `fence_timeout`     |

use crate::fence::DEFAULT_FENCE_TIMEOUT;
use crate::sys::time::Duration;

pub const BUFFERING_DEPTH_VAR: &str = "AAF_BUFFERING_DEPTH";
pub const MAX_STAGING_BYTES_VAR: &str = "AAF_MAX_STAGING_BYTES";
pub const FENCE_TIMEOUT_MS_VAR: &str = "AAF_FENCE_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    /// How many frames may be in flight at once.  Must be at least 1.
    pub buffering_depth: usize,
    /// Size of each frame slot's staging arena.
    pub max_staging_bytes: usize,
    /// Alignment contract of each staging arena's root.
    pub staging_alignment: usize,
    /// How long `start_frame` waits on a slot's fence before treating the device as hung.
    pub fence_timeout: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameConfig {
            buffering_depth: 2,
            max_staging_bytes: 4 * 1024 * 1024,
            staging_alignment: 256,
            fence_timeout: DEFAULT_FENCE_TIMEOUT,
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Buffering depth must be at least 1")]
    ZeroBufferingDepth,
    #[error("Staging size must be nonzero")]
    ZeroStagingSize,
    #[error("Staging alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("Can't parse {variable}={value}")]
    Unparsable { variable: &'static str, value: String },
}

impl FrameConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_buffering_depth(self.buffering_depth)?;
        validate_staging_bytes(self.max_staging_bytes)?;
        if !self.staging_alignment.is_power_of_two() {
            return Err(ConfigError::InvalidAlignment(self.staging_alignment));
        }
        Ok(())
    }

    /// Defaults, overridden by any `AAF_*` environment variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = FrameConfig::default();
        if let Some(depth) = parse_var(&lookup, BUFFERING_DEPTH_VAR)? {
            config.buffering_depth = depth as usize;
        }
        if let Some(bytes) = parse_var(&lookup, MAX_STAGING_BYTES_VAR)? {
            config.max_staging_bytes = bytes as usize;
        }
        if let Some(ms) = parse_var(&lookup, FENCE_TIMEOUT_MS_VAR)? {
            config.fence_timeout = Duration::from_millis(ms);
        }
        config.validate()?;
        logwise::info_sync!(
            "FrameConfig: depth {depth}, staging {staging} bytes",
            depth = logwise::privacy::LogIt(config.buffering_depth),
            staging = logwise::privacy::LogIt(config.max_staging_bytes)
        );
        Ok(config)
    }
}

fn parse_var(
    lookup: &impl Fn(&str) -> Option<String>,
    variable: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(variable) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Unparsable { variable, value }),
    }
}

pub(crate) fn validate_buffering_depth(depth: usize) -> Result<(), ConfigError> {
    if depth == 0 {
        Err(ConfigError::ZeroBufferingDepth)
    } else {
        Ok(())
    }
}

pub(crate) fn validate_staging_bytes(bytes: usize) -> Result<(), ConfigError> {
    if bytes == 0 {
        Err(ConfigError::ZeroStagingSize)
    } else {
        Ok(())
    }
}
