// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Light chain types. The messager never validates blocks; it only needs
//! enough of a tipset to track head movement, walk parent links and key the
//! tipset cache.

use std::fmt;

use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use serde::{Deserialize, Serialize};

/// A set of block `CID`s that uniquely identifies a tipset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TipsetKey(Vec<Cid>);

impl TipsetKey {
    pub fn new(cids: Vec<Cid>) -> Self {
        TipsetKey(cids)
    }

    pub fn cids(&self) -> &[Cid] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TipsetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, cid) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{cid}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<Cid> for TipsetKey {
    fn from_iter<I: IntoIterator<Item = Cid>>(iter: I) -> Self {
        TipsetKey(iter.into_iter().collect())
    }
}

/// A tipset as seen by the messager: its key, its parent key and its epoch.
/// Two tipsets are equal iff their keys are equal.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct Tipset {
    key: TipsetKey,
    parents: TipsetKey,
    epoch: ChainEpoch,
}

impl Tipset {
    /// Builds a tipset view. The key must not be empty.
    pub fn new(key: TipsetKey, parents: TipsetKey, epoch: ChainEpoch) -> Self {
        debug_assert!(!key.is_empty(), "tipset key must not be empty");
        Tipset {
            key,
            parents,
            epoch,
        }
    }

    pub fn key(&self) -> &TipsetKey {
        &self.key
    }

    pub fn parents(&self) -> &TipsetKey {
        &self.parents
    }

    pub fn epoch(&self) -> ChainEpoch {
        self.epoch
    }

    /// The `CID`s of the blocks forming this tipset.
    pub fn block_cids(&self) -> &[Cid] {
        self.key.cids()
    }
}

impl PartialEq for Tipset {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
