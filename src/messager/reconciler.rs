// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Keeps the local wallet/address records in sync with the remote wallets.
//!
//! A scan loop diffs each wallet's reported key list against the local
//! relations, adopting new keys and draining vanished ones. A second loop
//! walks `Removing` relations until they can be deleted safely, i.e. once no
//! `Filled` message is outstanding for the address.

use std::sync::Arc;
use std::time::Duration;

use ahash::{HashMap, HashSet};
use chrono::Utc;
use fvm_shared::address::Address;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::Repo;
use crate::errors::Error;
use crate::message::MessageState;
use crate::messager::config::SharedParams;
use crate::messager::msg_cache::MessageStateCache;
use crate::messager::provider::Provider;
use crate::wallet::{AddressEntry, AddressState, Wallet, WalletAddress, WalletRegistry};

pub struct WalletReconciler {
    repo: Arc<dyn Repo>,
    provider: Arc<dyn Provider>,
    wallets: Arc<WalletRegistry>,
    msg_cache: Arc<MessageStateCache>,
    shared: Arc<RwLock<SharedParams>>,
    drain_interval: Duration,
}

impl WalletReconciler {
    pub fn new(
        repo: Arc<dyn Repo>,
        provider: Arc<dyn Provider>,
        wallets: Arc<WalletRegistry>,
        msg_cache: Arc<MessageStateCache>,
        shared: Arc<RwLock<SharedParams>>,
        drain_interval: Duration,
    ) -> Self {
        WalletReconciler {
            repo,
            provider,
            wallets,
            msg_cache,
            shared,
            drain_interval,
        }
    }

    pub async fn run_scan_loop(self: Arc<Self>, ctx: CancellationToken) -> anyhow::Result<()> {
        loop {
            // Re-read every tick so operators can adjust the interval through
            // the shared params without a restart.
            let interval = self.shared.read().scan_interval();
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.scan().await {
                warn!("wallet scan failed: {e}");
            }
        }
    }

    pub async fn run_drain_loop(self: Arc<Self>, ctx: CancellationToken) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.drain_interval) => {}
            }
            if let Err(e) = self.drain().await {
                warn!("relation drain failed: {e}");
            }
        }
    }

    /// Diffs every registered wallet's remote key list against the local
    /// relations. A poll failure on one wallet is transient and never blocks
    /// the others.
    pub async fn scan(&self) -> Result<(), Error> {
        for (name, api) in self.wallets.entries() {
            let remote: HashSet<Address> = match api.wallet_list().await {
                Ok(keys) => keys.into_iter().collect(),
                Err(e) => {
                    warn!(wallet = %name, "wallet poll failed: {e}");
                    continue;
                }
            };
            let wallet = match self.repo.get_wallet_by_name(&name)? {
                Some(wallet) => wallet,
                None if remote.is_empty() => continue,
                None => {
                    let wallet = Wallet::new(name.clone());
                    self.repo.save_wallet(&wallet)?;
                    wallet
                }
            };

            let relations = self.repo.list_wallet_addresses_by_wallet(&wallet.id)?;
            let known: HashMap<Address, &WalletAddress> =
                relations.iter().map(|rel| (rel.addr, rel)).collect();

            for addr in &remote {
                match known.get(addr) {
                    None => self.adopt(&wallet, *addr).await?,
                    Some(rel) if rel.addr_state == AddressState::Removing => {
                        // the key reappeared before the drain completed
                        info!(wallet = %name, address = %addr, "removing key reappeared, reviving relation");
                        let mut rel = (*rel).clone();
                        rel.addr_state = AddressState::Alive;
                        rel.updated_at = Utc::now();
                        self.repo.save_wallet_address(&rel)?;
                        if let Some(mut entry) = self.repo.get_address(addr)?
                            && entry.state == AddressState::Removing
                        {
                            entry.state = AddressState::Alive;
                            entry.updated_at = Utc::now();
                            self.repo.save_address(&entry)?;
                        }
                    }
                    // Alive stays Alive; Forbidden survives re-sync untouched.
                    Some(_) => {}
                }
            }

            for rel in &relations {
                if !remote.contains(&rel.addr) && rel.addr_state.live() {
                    info!(
                        wallet = %name,
                        address = %rel.addr,
                        "remote wallet no longer reports key, draining relation"
                    );
                    let mut rel = rel.clone();
                    rel.addr_state = AddressState::Removing;
                    rel.updated_at = Utc::now();
                    self.repo.save_wallet_address(&rel)?;
                }
            }
        }
        Ok(())
    }

    /// Creates the relation for a newly reported key, seeding a fresh ledger
    /// entry's nonce from the chain actor nonce.
    async fn adopt(&self, wallet: &Wallet, addr: Address) -> Result<(), Error> {
        match self.repo.get_address(&addr)? {
            None => {
                let head = self.provider.chain_head().await?;
                let nonce = match self.provider.state_get_actor(&addr, head.key()).await {
                    Ok(actor) => actor.nonce,
                    Err(e) => {
                        // retried on the next scan
                        warn!(address = %addr, "cannot seed nonce from chain, deferring adoption: {e}");
                        return Ok(());
                    }
                };
                self.repo.save_address(&AddressEntry::new(addr, nonce))?;
            }
            Some(mut entry) if !entry.state.live() => {
                entry.state = AddressState::Alive;
                entry.is_deleted = false;
                entry.updated_at = Utc::now();
                self.repo.save_address(&entry)?;
            }
            Some(_) => {}
        }
        self.repo
            .save_wallet_address(&WalletAddress::new(wallet.id, addr))?;
        info!(wallet = %wallet.name, address = %addr, "adopted wallet key");
        Ok(())
    }

    /// Drains `Removing` relations: blocks further selection, demotes
    /// messages that never got filled, and deletes the relation once zero
    /// `Filled` messages remain. The loop interval is the retry back-off.
    pub async fn drain(&self) -> Result<(), Error> {
        for mut rel in self
            .repo
            .list_wallet_addresses_by_state(AddressState::Removing)?
        {
            let others_live = self
                .repo
                .list_wallet_addresses_by_addr(&rel.addr)?
                .iter()
                .any(|other| other.id != rel.id && other.addr_state.live());

            if !others_live {
                // The draining relation was the last signer for the address:
                // stop selection and fail over the unfilled backlog.
                if let Some(mut entry) = self.repo.get_address(&rel.addr)?
                    && entry.state.live()
                {
                    entry.state = AddressState::Removing;
                    entry.updated_at = Utc::now();
                    self.repo.save_address(&entry)?;
                }
                for mut msg in self.repo.list_unfilled_messages(&rel.addr)? {
                    msg.transition(MessageState::NoWallet)?;
                    self.repo.save_message(&msg)?;
                    self.msg_cache.set(msg);
                }
                let outstanding = self.repo.list_filled_messages(&rel.addr)?.len();
                if outstanding > 0 {
                    debug!(
                        address = %rel.addr,
                        outstanding,
                        "relation still has filled messages, retrying later"
                    );
                    continue;
                }
            }

            rel.addr_state = AddressState::Removed;
            rel.is_deleted = true;
            rel.updated_at = Utc::now();
            self.repo.save_wallet_address(&rel)?;
            info!(address = %rel.addr, "wallet-address relation removed");

            if !others_live
                && let Some(mut entry) = self.repo.get_address(&rel.addr)?
                && !entry.is_deleted
            {
                entry.state = AddressState::Removed;
                entry.is_deleted = true;
                entry.updated_at = Utc::now();
                self.repo.save_address(&entry)?;
            }

            if self
                .repo
                .list_wallet_addresses_by_wallet(&rel.wallet_id)?
                .is_empty()
                && let Some(mut wallet) = self.repo.get_wallet(&rel.wallet_id)?
                && !wallet.is_deleted
            {
                info!(wallet = %wallet.name, "wallet has no remaining keys, removing it");
                wallet.is_deleted = true;
                wallet.updated_at = Utc::now();
                self.repo.save_wallet(&wallet)?;
            }
        }
        Ok(())
    }
}
