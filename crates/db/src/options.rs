//! Parses the external configuration surface (§6) into a [`StoreConfig`].
//!
//! Options arrive as a single `key:value(,key:value)*` string, mirroring how
//! the CLI and embedders pass them, and are distinct from the on-disk
//! ASCII header grammar used inside chunks: values here are plain decimal
//! or boolean literals, not hex.

use storage::chunk_store::StoreConfig;

use crate::error::{DbError, Result};

/// Builds a [`StoreConfig`] from defaults, then applies `options` on top.
/// `encryptionKey` is recognized but not retained on `StoreConfig`; wiring
/// an [`storage::block_io::EncryptionTransformer`] onto the underlying file
/// is the caller's responsibility once the key material itself is handled.
pub fn parse_options(options: &str, block_size: u64) -> Result<StoreConfig> {
    let mut config = StoreConfig {
        block_size,
        ..StoreConfig::default()
    };
    let trimmed = options.trim();
    if trimmed.is_empty() {
        return Ok(config);
    }
    for pair in trimmed.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair
            .split_once(':')
            .ok_or_else(|| DbError::InvalidConfig(format!("malformed option '{pair}'")))?;
        let value = value.trim();
        match key.trim() {
            "readOnly" => config.read_only = parse_bool(key, value)?,
            "autoCommitBufferKB" => config.auto_commit_buffer_kb = parse_u32(key, value)?,
            "retentionTime" => config.retention_time_ms = parse_u64(key, value)?,
            "maxFileCount" => config.max_file_count = parse_u32(key, value)?,
            "compress" => config.compress = parse_u8(key, value)?,
            "pageSplitSize" => config.page_split_size = parse_u32(key, value)?,
            "encryptionKey" => {}
            other => {
                tracing::warn!(key = other, "ignoring unknown store option");
            }
        }
    }
    Ok(config)
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(DbError::InvalidConfig(format!("'{key}' expects true/false, got '{value}'"))),
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| DbError::InvalidConfig(format!("'{key}' expects an integer, got '{value}'")))
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| DbError::InvalidConfig(format!("'{key}' expects an integer, got '{value}'")))
}

fn parse_u8(key: &str, value: &str) -> Result<u8> {
    value
        .parse()
        .map_err(|_| DbError::InvalidConfig(format!("'{key}' expects 0, 1, or 2, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_an_empty_option_string() {
        let config = parse_options("", 4096).unwrap();
        assert_eq!(config.block_size, 4096);
        assert!(!config.read_only);
        assert_eq!(config.retention_time_ms, 45_000);
    }

    #[test]
    fn recognized_keys_override_defaults() {
        let config = parse_options("readOnly:true,retentionTime:1000,maxFileCount:4", 4096).unwrap();
        assert!(config.read_only);
        assert_eq!(config.retention_time_ms, 1000);
        assert_eq!(config.max_file_count, 4);
    }

    #[test]
    fn malformed_pair_is_rejected() {
        assert!(parse_options("readOnly", 4096).is_err());
    }

    #[test]
    fn bad_boolean_is_rejected() {
        assert!(parse_options("readOnly:yes", 4096).is_err());
    }
}
