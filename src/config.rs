// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Top-level index configuration, loadable from YAML. Mirrors
//! `RocksDbConfig`'s `#[serde(default)]`-per-field, validated-`Default`
//! style (`rocks_config.rs`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::Geometry;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexConfig {
    pub geometry: Geometry,
    /// Directory holding the volume file, chapter-index pages, and the
    /// clean-shutdown save region.
    pub path: PathBuf,
    /// Number of concurrency zones (§4.9); also the number of volume-index
    /// shards (§4.7).
    pub zone_count: u32,
    /// Whether the index keeps sparse chapters at all (§4.8); when false,
    /// `sparse_chapters_per_volume` is ignored and every chapter is dense.
    pub sparse: bool,
    /// Nonce stamped into the super block and every chapter page header
    /// (§3 supplemented); used to detect foreign volumes on load.
    pub nonce: u64,
    /// Read threads serving the volume page cache (§4.6 supplemented).
    pub read_threads: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            path: PathBuf::from("."),
            zone_count: num_cpus::get().clamp(1, 16) as u32,
            sparse: true,
            nonce: 0,
            read_threads: 2,
        }
    }
}

impl IndexConfig {
    pub fn load_yaml(bytes: &[u8]) -> Result<Self> {
        let config: Self = serde_yaml::from_slice(bytes).map_err(|e| Error::CorruptData(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::CorruptData(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry.validate()?;
        if self.zone_count == 0 {
            return Err(Error::InvalidArgument("zone_count must be non-zero".into()));
        }
        if self.read_threads == 0 {
            return Err(Error::InvalidArgument("read_threads must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        IndexConfig::default().validate().unwrap();
    }

    #[test]
    fn yaml_round_trip() {
        let config = IndexConfig::default();
        let yaml = config.to_yaml().unwrap();
        let restored = IndexConfig::load_yaml(yaml.as_bytes()).unwrap();
        assert_eq!(config, restored);
    }
}
