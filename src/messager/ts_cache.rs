// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;

use fvm_shared::clock::ChainEpoch;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::blocks::{Tipset, TipsetKey};
use crate::errors::Error;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheState {
    network_name: String,
    /// Recently seen tipsets, ascending by epoch. The last entry is the
    /// current head.
    tipsets: Vec<Tipset>,
}

/// Append-mostly ring of recently seen tipsets, persisted as JSON so the
/// reconnect check can walk from the pre-restart head to the live head.
///
/// The recorded network name must match the live chain's; a mismatched file
/// is discarded on load rather than reconciled against the wrong chain.
pub struct TipsetCache {
    capacity: usize,
    path: PathBuf,
    state: Mutex<CacheState>,
}

impl TipsetCache {
    pub fn new(capacity: usize, path: PathBuf, network_name: String) -> Self {
        TipsetCache {
            capacity,
            path,
            state: Mutex::new(CacheState {
                network_name,
                tipsets: Vec::new(),
            }),
        }
    }

    /// Loads the persisted cache, starting empty when the file is missing,
    /// unreadable, or was built against another network.
    pub fn load(capacity: usize, path: PathBuf, network_name: String) -> Self {
        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheState>(&bytes) {
                Ok(state) if state.network_name == network_name => Some(state),
                Ok(state) => {
                    warn!(
                        cached = %state.network_name,
                        actual = %network_name,
                        "tipset cache belongs to another network, discarding it"
                    );
                    None
                }
                Err(e) => {
                    warn!("failed to decode tipset cache, discarding it: {e}");
                    None
                }
            },
            // A missing file is the common first-run case.
            Err(_) => None,
        };
        match state {
            Some(state) => TipsetCache {
                capacity,
                path,
                state: Mutex::new(state),
            },
            None => TipsetCache::new(capacity, path, network_name),
        }
    }

    pub fn network_name(&self) -> String {
        self.state.lock().network_name.clone()
    }

    /// The most recent tipset in the cache, if any.
    pub fn head(&self) -> Option<Tipset> {
        self.state.lock().tipsets.last().cloned()
    }

    pub fn cur_height(&self) -> ChainEpoch {
        self.head().map(|ts| ts.epoch()).unwrap_or_default()
    }

    pub fn find(&self, key: &TipsetKey) -> Option<Tipset> {
        self.state
            .lock()
            .tipsets
            .iter()
            .find(|ts| ts.key() == key)
            .cloned()
    }

    /// Records an applied tipset, replacing any same-height entry and
    /// pruning the oldest entries beyond capacity.
    pub fn add(&self, ts: &Tipset) {
        let mut state = self.state.lock();
        state.tipsets.retain(|t| t.epoch() != ts.epoch());
        let at = state
            .tipsets
            .partition_point(|t| t.epoch() < ts.epoch());
        state.tipsets.insert(at, ts.clone());
        if state.tipsets.len() > self.capacity {
            let excess = state.tipsets.len() - self.capacity;
            state.tipsets.drain(..excess);
        }
    }

    /// Drops a reverted tipset from the window.
    pub fn revert(&self, ts: &Tipset) {
        self.state.lock().tipsets.retain(|t| t.key() != ts.key());
    }

    /// Discards all history and restarts the window at `head`.
    pub fn reset(&self, head: &Tipset) {
        self.state.lock().tipsets = vec![head.clone()];
    }

    pub fn save(&self) -> Result<(), Error> {
        let bytes = serde_json::to_vec_pretty(&*self.state.lock())?;
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}
