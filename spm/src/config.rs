//! Partition manager configuration

use crate::error::LoadError;
use crate::handle::{HandleCodec, DEFAULT_SALT_BITS, MAX_SALT_BITS};
use core_types::handle::STATELESS_INDICATOR;
use serde::{Deserialize, Serialize};

/// Build-time sizing of the partition manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpmConfig {
    /// Number of connections that may exist at once
    pub connection_pool_size: usize,
    /// Width of the rotating salt mixed into connection handles
    pub handle_salt_bits: u32,
}

impl Default for SpmConfig {
    fn default() -> Self {
        Self {
            connection_pool_size: 8,
            handle_salt_bits: DEFAULT_SALT_BITS,
        }
    }
}

impl SpmConfig {
    /// Sets the connection pool size
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    /// Sets the handle salt width
    pub fn with_salt_bits(mut self, bits: u32) -> Self {
        self.handle_salt_bits = bits;
        self
    }

    /// Checks that every handle the pool can produce stays clear of the
    /// stateless indicator bit
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.connection_pool_size == 0 {
            return Err(LoadError::InvalidConfig(
                "connection pool must hold at least one connection".to_string(),
            ));
        }
        if self.handle_salt_bits > MAX_SALT_BITS {
            return Err(LoadError::InvalidConfig(format!(
                "handle salt width {} exceeds {}",
                self.handle_salt_bits, MAX_SALT_BITS
            )));
        }

        let codec = HandleCodec::new(self.handle_salt_bits);
        if codec.max_handle_value(self.connection_pool_size) >= STATELESS_INDICATOR as u64 {
            return Err(LoadError::InvalidConfig(format!(
                "connection pool of {} overflows the handle space",
                self.connection_pool_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SpmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_pool() {
        assert!(SpmConfig::default().with_pool_size(0).validate().is_err());
    }

    #[test]
    fn test_rejects_wide_salt() {
        assert!(SpmConfig::default().with_salt_bits(6).validate().is_err());
    }

    #[test]
    fn test_rejects_pool_overflowing_handle_space() {
        let config = SpmConfig::default().with_pool_size(1 << 27);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json() {
        let config: SpmConfig = serde_json::from_str(r#"{"connection_pool_size": 2}"#).unwrap();
        assert_eq!(config.connection_pool_size, 2);
        assert_eq!(config.handle_salt_bits, DEFAULT_SALT_BITS);
    }
}
