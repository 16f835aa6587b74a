//! Persisted engine state: residue checkpoints and recovery streams.
//!
//! Every blob is tagged and versioned so loaders can detect mismatches — a
//! working file that last held an iteration-only cursor simply yields no
//! residue state on reload, and the task falls back to its recovery stream.
//! Writes go through a temp file and an atomic rename so a crash mid-write
//! never clobbers the previous checkpoint.

use anyhow::Result;
use rug::Integer;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Bumped whenever the on-disk layout changes incompatibly.
pub const STATE_VERSION: u32 = 2;

/// Recovery-grade checkpoint: the residue at a committed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub iteration: u64,
    pub x: Integer,
}

/// Working checkpoint for the Gerbicz-checked task: the residue plus the
/// check accumulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GerbiczCheckState {
    pub iteration: u64,
    pub x: Integer,
    pub d: Integer,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type")]
enum Blob {
    Residue {
        version: u32,
        iteration: u64,
        x: Integer,
    },
    Checked {
        version: u32,
        iteration: u64,
        x: Integer,
        d: Integer,
    },
    Cursor {
        version: u32,
        iteration: u64,
    },
}

/// Handle to one on-disk state stream.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_state(&self, state: &State) -> Result<()> {
        self.write(&Blob::Residue {
            version: STATE_VERSION,
            iteration: state.iteration,
            x: state.x.clone(),
        })
    }

    pub fn write_check_state(&self, state: &GerbiczCheckState) -> Result<()> {
        self.write(&Blob::Checked {
            version: STATE_VERSION,
            iteration: state.iteration,
            x: state.x.clone(),
            d: state.d.clone(),
        })
    }

    /// Record that everything up to `iteration` is already covered by the
    /// recovery stream, without carrying a residue.
    pub fn write_cursor(&self, iteration: u64) -> Result<()> {
        self.write(&Blob::Cursor {
            version: STATE_VERSION,
            iteration,
        })
    }

    /// Load a residue checkpoint, or `None` if the file is absent, damaged,
    /// from another layout version, or holds a different blob kind.
    pub fn read_state(&self) -> Option<State> {
        match self.read()? {
            Blob::Residue {
                version,
                iteration,
                x,
            } if version == STATE_VERSION => Some(State { iteration, x }),
            _ => {
                warn!(path = %self.path.display(), "ignoring unusable state blob");
                None
            }
        }
    }

    /// Load a working checkpoint, with the same tolerance as `read_state`.
    pub fn read_check_state(&self) -> Option<GerbiczCheckState> {
        match self.read()? {
            Blob::Checked {
                version,
                iteration,
                x,
                d,
            } if version == STATE_VERSION => Some(GerbiczCheckState { iteration, x, d }),
            _ => {
                warn!(path = %self.path.display(), "ignoring unusable state blob");
                None
            }
        }
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }

    fn write(&self, blob: &Blob) -> Result<()> {
        let json = serde_json::to_string(blob)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read(&self) -> Option<Blob> {
        let data = fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(&data).ok()
    }
}
