// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Remote wallets, managed sending addresses and the relation between them.
//!
//! A [`Wallet`] is a remote signer endpoint; a [`WalletAddress`] relation is
//! created whenever that wallet reports a key and drained when the key
//! disappears. The [`AddressEntry`] ledger row is the source of truth for
//! "next nonce to assign" per sending address.

use ahash::HashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::message::SendSpec;

/// Lifecycle state shared by the address ledger and wallet-address relations.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum AddressState {
    Alive,
    Forbidden,
    Removing,
    Removed,
}

impl AddressState {
    /// May new messages be selected against it.
    pub fn selectable(self) -> bool {
        matches!(self, AddressState::Alive)
    }

    /// Still owns its pending messages (selection may be paused).
    pub fn live(self) -> bool {
        matches!(self, AddressState::Alive | AddressState::Forbidden)
    }
}

/// Ledger row for a sending address under local management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressEntry {
    pub id: Uuid,
    pub addr: Address,
    /// Next nonce to assign. Non-decreasing: advanced by the selector after a
    /// successful sign, or resynchronized upward from the chain actor nonce.
    pub nonce: u64,
    /// Selection priority, ascending.
    pub weight: i64,
    /// Per-address cap on unconfirmed messages. Zero defers to the shared
    /// runtime default.
    pub sel_msg_num: u64,
    pub fee_spec: SendSpec,
    pub state: AddressState,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressEntry {
    pub fn new(addr: Address, nonce: u64) -> Self {
        let now = Utc::now();
        AddressEntry {
            id: Uuid::new_v4(),
            addr,
            nonce,
            weight: 0,
            sel_msg_num: 0,
            fee_spec: SendSpec::default(),
            state: AddressState::Alive,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A registered remote signer endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub name: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Wallet {
            id: Uuid::new_v4(),
            name,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Relation between a wallet and an address it can sign for, with its own
/// lifecycle and an optional per-relation selection cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub addr: Address,
    pub addr_state: AddressState,
    pub sel_msg_num: u64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAddress {
    pub fn new(wallet_id: Uuid, addr: Address) -> Self {
        let now = Utc::now();
        WalletAddress {
            id: Uuid::new_v4(),
            wallet_id,
            addr,
            addr_state: AddressState::Alive,
            sel_msg_num: 0,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Remote wallet boundary. Polled by the reconciler and called synchronously
/// by the selector; implementations are expected to respect call deadlines.
#[async_trait]
pub trait WalletApi: Send + Sync {
    /// All addresses the wallet can currently sign for.
    async fn wallet_list(&self) -> anyhow::Result<Vec<Address>>;
    /// Whether the wallet can currently sign for `addr`.
    async fn wallet_has(&self, addr: &Address) -> anyhow::Result<bool>;
    /// Signs `data` (the unsigned message digest bytes) with the key of
    /// `addr`.
    async fn wallet_sign(&self, addr: &Address, data: &[u8]) -> anyhow::Result<Signature>;
}

/// A named wallet client to register with the service.
pub struct WalletHandle {
    pub name: String,
    pub api: Arc<dyn WalletApi>,
}

/// Wallet clients keyed by wallet name, shared across the service loops.
#[derive(Default)]
pub struct WalletRegistry {
    inner: RwLock<HashMap<String, Arc<dyn WalletApi>>>,
}

impl WalletRegistry {
    pub fn new(handles: Vec<WalletHandle>) -> Self {
        let inner = handles
            .into_iter()
            .map(|handle| (handle.name, handle.api))
            .collect();
        WalletRegistry {
            inner: RwLock::new(inner),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn WalletApi>> {
        self.inner.read().get(name).cloned()
    }

    pub fn insert(&self, name: String, api: Arc<dyn WalletApi>) {
        self.inner.write().insert(name, api);
    }

    pub fn remove(&self, name: &str) {
        self.inner.write().remove(name);
    }

    pub fn entries(&self) -> Vec<(String, Arc<dyn WalletApi>)> {
        self.inner
            .read()
            .iter()
            .map(|(name, api)| (name.clone(), api.clone()))
            .collect()
    }
}
