// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Session lifecycle (§4.11): a small explicit state machine guarding which
//! operations are legal at any moment, wrapping the volume, volume index,
//! and stats behind a single handle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::IndexConfig;
use crate::error::{Error, Result};
use crate::recovery::{discover_boundaries, rebuild, RebuildProgress};
use crate::stats::{SessionStats, StatsSnapshot};
use crate::volume::Volume;
use crate::volume_index::VolumeIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Fresh,
    Loading,
    Loaded,
    Suspended,
    Closing,
    Destroying,
}

/// How an existing index directory should be treated on `open`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail with `NotFound` if no clean save region exists.
    Load,
    /// Create a fresh index, discarding anything already on disk.
    Create,
    /// Load a clean save if present; otherwise rebuild from the volume
    /// instead of treating a dirty directory as an error.
    NoRebuildUnlessDirty,
}

const SAVE_FILE_NAME: &str = "volume_index.save";

/// A live index handle. `state` gates which methods may run; callers that
/// violate the guard get `Error::Busy` rather than a panic or silent no-op.
pub struct Session {
    config: IndexConfig,
    state: Mutex<SessionState>,
    volume: Volume,
    volume_index: Mutex<VolumeIndex>,
    stats: Arc<SessionStats>,
    rebuild_progress: RebuildProgress,
}

impl Session {
    fn save_path(config: &IndexConfig) -> PathBuf {
        config.path.join(SAVE_FILE_NAME)
    }

    /// Creates a brand-new index at `config.path`, discarding any existing
    /// volume file there.
    pub fn create(config: IndexConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.path)?;
        let volume_path = config.path.join("volume.dat");
        let volume = Volume::create(&volume_path, config.geometry, config.read_threads, 1024)?;
        let volume_index = VolumeIndex::new(&config.geometry, config.zone_count, 1024);
        let _ = std::fs::remove_file(Self::save_path(&config));
        Ok(Self {
            config,
            state: Mutex::new(SessionState::Loaded),
            volume,
            volume_index: Mutex::new(volume_index),
            stats: Arc::new(SessionStats::default()),
            rebuild_progress: RebuildProgress::default(),
        })
    }

    /// Opens an index directory per `mode`. `LOAD` requires a clean save
    /// region; `CREATE` always starts fresh; `NO_REBUILD_UNLESS_DIRTY`
    /// loads a clean save if present and otherwise rebuilds from the
    /// surviving chapters on the volume (§4.10).
    pub fn open(config: IndexConfig, mode: OpenMode) -> Result<Self> {
        config.validate()?;
        let volume_path = config.path.join("volume.dat");
        let save_path = Self::save_path(&config);

        match mode {
            OpenMode::Create => return Self::create(config),
            OpenMode::Load => {
                if !save_path.exists() {
                    return Err(Error::NotFound);
                }
            }
            OpenMode::NoRebuildUnlessDirty => {}
        }

        if !volume_path.exists() {
            return Err(Error::NotFound);
        }
        let volume = Volume::open(&volume_path, config.geometry, config.read_threads, 1024)?;

        let rebuild_progress = RebuildProgress::default();
        let stats = Arc::new(SessionStats::default());

        let volume_index = if save_path.exists() {
            info!(path = %save_path.display(), "loading clean save region");
            let bytes = std::fs::read(&save_path)?;
            let restored = VolumeIndex::restore(&bytes)?;
            if restored.zone_count() != config.zone_count {
                return Err(Error::CorruptData("saved zone count mismatch".into()));
            }
            restored
        } else {
            warn!("no clean save region found, rebuilding volume index from chapters on disk");
            let mut volume_index = VolumeIndex::new(&config.geometry, config.zone_count, 1024);
            let (lowest, highest) = discover_boundaries(&config.geometry, &volume, 5, &[])?;
            rebuild(
                &config.geometry,
                &volume,
                &mut volume_index,
                lowest,
                highest,
                &rebuild_progress,
                &stats,
                || true,
            )?;
            info!(chapters_replayed = rebuild_progress.chapters_replayed(), "rebuild complete");
            volume_index
        };

        Ok(Self {
            config,
            state: Mutex::new(SessionState::Loaded),
            volume,
            volume_index: Mutex::new(volume_index),
            stats,
            rebuild_progress,
        })
    }

    fn require_state(&self, expected: &[SessionState]) -> Result<()> {
        let state = *self.state.lock();
        if expected.contains(&state) {
            Ok(())
        } else {
            Err(Error::Busy)
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn volume_index(&self) -> &Mutex<VolumeIndex> {
        &self.volume_index
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn stats_handle(&self) -> Arc<SessionStats> {
        self.stats.clone()
    }

    /// How many chapters the rebuild that produced this session (if any)
    /// had replayed by the time it finished or was last paused.
    pub fn rebuild_progress(&self) -> &RebuildProgress {
        &self.rebuild_progress
    }

    /// Persists the volume index and moves to `Suspended`, leaving the
    /// volume file untouched so `resume` can reopen it without replaying
    /// anything.
    pub fn suspend(&self, save: bool) -> Result<()> {
        self.require_state(&[SessionState::Loaded])?;
        *self.state.lock() = SessionState::Suspended;
        info!(save, "session suspended");
        if save {
            self.write_save()?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.require_state(&[SessionState::Suspended])?;
        *self.state.lock() = SessionState::Loaded;
        info!("session resumed");
        Ok(())
    }

    /// Persists (if requested) and transitions through `Closing`; the
    /// session handle should be dropped after this returns.
    pub fn close(&self, save: bool) -> Result<()> {
        self.require_state(&[SessionState::Loaded, SessionState::Suspended])?;
        *self.state.lock() = SessionState::Closing;
        if save {
            self.write_save()?;
        }
        Ok(())
    }

    /// Discards any in-progress rebuild, deletes the save region, and
    /// transitions to `Destroying`; the volume file itself is left for the
    /// caller to remove (mirrors the "destroy discards progress" contract
    /// of §4.11, without taking on filesystem-wide deletion here).
    pub fn destroy(&self) -> Result<()> {
        *self.state.lock() = SessionState::Destroying;
        let _ = std::fs::remove_file(Self::save_path(&self.config));
        Ok(())
    }

    fn write_save(&self) -> Result<()> {
        let index = self.volume_index.lock();
        let bytes = index.save()?;
        std::fs::write(Self::save_path(&self.config), bytes)?;
        Ok(())
    }
}

pub fn default_config_at(path: &Path) -> IndexConfig {
    IndexConfig {
        path: path.to_path_buf(),
        ..IndexConfig::default()
    }
}
