// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Reconciliation of local message state against applied and reverted
//! tipsets. This is where reorgs, external replacements and receipts land in
//! the repository.

use std::sync::Arc;
use std::time::Duration;

use ahash::{HashSet, HashSetExt};
use chrono::Utc;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::blocks::{Tipset, TipsetKey};
use crate::db::Repo;
use crate::errors::Error;
use crate::message::{Message, MessageReceipt, MessageState, UnsignedMessage};
use crate::messager::msg_cache::MessageStateCache;
use crate::messager::provider::Provider;
use crate::messager::ts_cache::TipsetCache;
use crate::utils::cid_from_cbor;

/// Cancelable trigger for the selection loop. Arming replaces any pending
/// delayed firing, so a newer head change always supersedes a stale timer.
pub struct SelectionTrigger {
    tx: flume::Sender<()>,
    delayed: Mutex<Option<JoinHandle<()>>>,
}

impl SelectionTrigger {
    pub fn new() -> (Arc<Self>, flume::Receiver<()>) {
        let (tx, rx) = flume::bounded(1);
        (
            Arc::new(SelectionTrigger {
                tx,
                delayed: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Fires immediately. A full channel means a round is already queued.
    pub fn fire(&self) {
        let _ = self.tx.try_send(());
    }

    /// Fires after `delay`, cancelling any pending delayed firing.
    pub fn arm(&self, delay: Duration) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        });
        if let Some(old) = self.delayed.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn cancel(&self) {
        if let Some(handle) = self.delayed.lock().take() {
            handle.abort();
        }
    }
}

struct AppliedMessage {
    msg: UnsignedMessage,
    unsigned_cid: Cid,
    receipt: MessageReceipt,
    epoch: ChainEpoch,
    key: TipsetKey,
}

/// Applies one `(revert, apply)` batch to the repository, the message state
/// cache and the tipset cache.
pub struct MessageStateRefresher {
    repo: Arc<dyn Repo>,
    provider: Arc<dyn Provider>,
    msg_cache: Arc<MessageStateCache>,
    ts_cache: Arc<TipsetCache>,
    trigger: Arc<SelectionTrigger>,
    trigger_delay: Duration,
}

impl MessageStateRefresher {
    pub fn new(
        repo: Arc<dyn Repo>,
        provider: Arc<dyn Provider>,
        msg_cache: Arc<MessageStateCache>,
        ts_cache: Arc<TipsetCache>,
        trigger: Arc<SelectionTrigger>,
        trigger_delay: Duration,
    ) -> Self {
        MessageStateRefresher {
            repo,
            provider,
            msg_cache,
            ts_cache,
            trigger,
            trigger_delay,
        }
    }

    /// Processes one batch. Reverts are rolled back to `Filled` with a
    /// sentinel receipt, applied messages get their receipt and height, and a
    /// content mismatch at the same `(sender, nonce)` marks the local message
    /// `Replaced`. All repository writes happen in one transaction; an error
    /// rolls the whole batch back.
    pub async fn refresh(
        &self,
        revert: &[Arc<Tipset>],
        apply: &[Arc<Tipset>],
        reconnect: bool,
    ) -> Result<(), Error> {
        let managed: HashSet<Address> = self
            .repo
            .list_addresses()?
            .into_iter()
            .filter(|entry| entry.state.live())
            .map(|entry| entry.addr)
            .collect();

        let mut to_revert: Vec<Uuid> = Vec::new();
        for ts in revert {
            for msg in self.repo.list_on_chain_messages_by_height(ts.epoch())? {
                if managed.contains(&msg.from_addr()) {
                    to_revert.push(msg.id);
                }
            }
        }

        let mut applied: Vec<AppliedMessage> = Vec::new();
        // Blocks of one tipset share their parent, so the same parent message
        // shows up once per block.
        let mut seen: HashSet<Cid> = HashSet::new();
        for ts in apply {
            for block in ts.block_cids() {
                let msgs = self.provider.chain_get_parent_messages(block).await?;
                let receipts = self.provider.chain_get_parent_receipts(block).await?;
                if msgs.len() != receipts.len() {
                    return Err(Error::MismatchedReceipts {
                        block: *block,
                        messages: msgs.len(),
                        receipts: receipts.len(),
                    });
                }
                for (msg, receipt) in msgs.into_iter().zip(receipts) {
                    if !managed.contains(&msg.from) {
                        continue;
                    }
                    let unsigned_cid = cid_from_cbor(&msg)?;
                    if !seen.insert(unsigned_cid) {
                        continue;
                    }
                    applied.push(AppliedMessage {
                        msg,
                        unsigned_cid,
                        receipt,
                        epoch: ts.epoch(),
                        key: ts.key().clone(),
                    });
                }
            }
        }

        let mut touched: Vec<Message> = Vec::new();
        self.repo.transaction(&mut |tx| {
            touched.clear();
            for id in &to_revert {
                let Some(mut msg) = tx.get_message(id)? else {
                    continue;
                };
                msg.transition(MessageState::Filled)?;
                msg.receipt = Some(MessageReceipt::reverted());
                msg.height = 0;
                msg.tipset_key = None;
                tx.save_message(&msg)?;
                touched.push(msg);
            }
            for item in &applied {
                let Some(mut local) =
                    tx.get_message_by_from_and_nonce(&item.msg.from, item.msg.sequence)?
                else {
                    debug!(
                        from = %item.msg.from,
                        nonce = item.msg.sequence,
                        "applied message was not sent through this pool, skipping"
                    );
                    continue;
                };
                if local.unsigned_cid != Some(item.unsigned_cid) {
                    // Same (sender, nonce), different content: something else
                    // took this nonce, e.g. an externally rebroadcast variant.
                    local.message = item.msg.clone();
                    local.unsigned_cid = Some(item.unsigned_cid);
                    local.signature = None;
                    local.signed_cid = None;
                    local.receipt = Some(item.receipt.clone());
                    local.height = item.epoch;
                    local.tipset_key = Some(item.key.clone());
                    local.transition(MessageState::Replaced)?;
                } else {
                    local.receipt = Some(item.receipt.clone());
                    local.height = item.epoch;
                    local.tipset_key = Some(item.key.clone());
                    if local.state == MessageState::OnChain {
                        // re-applied after a revert/apply round trip
                        local.updated_at = Utc::now();
                    } else {
                        local.transition(MessageState::OnChain)?;
                    }
                }
                tx.save_message(&local)?;
                touched.push(local);
            }
            Ok(())
        })?;

        for msg in touched {
            self.msg_cache.set(msg);
        }
        for ts in revert {
            self.ts_cache.revert(ts);
        }
        for ts in apply {
            self.ts_cache.add(ts);
        }
        if let Err(e) = self.ts_cache.save() {
            warn!("failed to persist tipset cache: {e}");
        }

        self.trigger.cancel();
        if !reconnect {
            self.trigger.arm(self.trigger_delay);
        }
        Ok(())
    }
}
