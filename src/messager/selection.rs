// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Contains routines for message selection. Whenever the head settles, the
//! service invokes [`MessageSelector::select_message`], which decides per
//! address which pending messages become fillable this round: it excludes
//! expired messages, estimates gas, assigns nonces, obtains signatures and
//! bounds the number of unconfirmed messages in flight.

use std::sync::Arc;

use chrono::Utc;
use fvm_shared::address::Address;
use num_bigint::BigInt;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blocks::Tipset;
use crate::db::Repo;
use crate::errors::Error;
use crate::message::{Message, MessageState, SendSpec, SignedMessage, UnsignedMessage};
use crate::messager::config::{MessagerConfig, SharedParams};
use crate::messager::metrics;
use crate::messager::provider::Provider;
use crate::wallet::{WalletAddress, WalletApi, WalletRegistry};

/// Per-message selection failure, reported without blocking other messages.
#[derive(Debug, Clone)]
pub struct MsgErrInfo {
    pub id: Uuid,
    pub error: String,
}

/// Outcome of one selection round, partitioned the way the caller persists
/// and dispatches it.
#[derive(Debug, Default)]
pub struct MsgSelectResult {
    /// Freshly filled messages: nonce assigned, gas estimated, signed.
    pub selected: Vec<Message>,
    /// Messages whose expiry epoch passed before they could be filled.
    pub expired: Vec<Message>,
    /// Already-signed messages still ahead of the chain nonce.
    pub to_rebroadcast: Vec<SignedMessage>,
    /// Address ledger entries whose nonce advanced this round.
    pub modified: Vec<crate::wallet::AddressEntry>,
    /// Per-message failures.
    pub errors: Vec<MsgErrInfo>,
}

impl MsgSelectResult {
    fn merge(&mut self, mut other: MsgSelectResult) {
        self.selected.append(&mut other.selected);
        self.expired.append(&mut other.expired);
        self.to_rebroadcast.append(&mut other.to_rebroadcast);
        self.modified.append(&mut other.modified);
        self.errors.append(&mut other.errors);
    }
}

/// Selects fillable messages per address with bounded parallelism. Callers
/// must serialize rounds globally: a round, including persistence of its
/// result, completes before the next begins, which is what protects the
/// nonce invariant.
#[derive(Clone)]
pub struct MessageSelector {
    repo: Arc<dyn Repo>,
    provider: Arc<dyn Provider>,
    wallets: Arc<WalletRegistry>,
    shared: Arc<RwLock<SharedParams>>,
    concurrency: usize,
    estimate_fail_limit: u32,
}

impl MessageSelector {
    pub fn new(
        repo: Arc<dyn Repo>,
        provider: Arc<dyn Provider>,
        wallets: Arc<WalletRegistry>,
        shared: Arc<RwLock<SharedParams>>,
        cfg: &MessagerConfig,
    ) -> Self {
        MessageSelector {
            repo,
            provider,
            wallets,
            shared,
            concurrency: cfg.sel_concurrency.max(1),
            estimate_fail_limit: cfg.estimate_fail_limit.max(1),
        }
    }

    /// Runs selection for every selectable address against `ts`. Addresses
    /// are processed independently; a failure in one never blocks the
    /// others. Results are merged after all per-address tasks join.
    pub async fn select_message(&self, ts: &Arc<Tipset>) -> Result<MsgSelectResult, Error> {
        let entries: Vec<_> = self
            .repo
            .list_addresses()?
            .into_iter()
            .filter(|entry| entry.state.selectable())
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(Address, Result<MsgSelectResult, Error>)> = JoinSet::new();
        for entry in entries {
            let selector = self.clone();
            let semaphore = semaphore.clone();
            let ts = ts.clone();
            tasks.spawn(async move {
                let addr = entry.addr;
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (addr, Err(Error::Other("selector closed".into()))),
                };
                (addr, selector.select_for_address(entry, &ts).await)
            });
        }

        let mut result = MsgSelectResult::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(part))) => result.merge(part),
                Ok((addr, Err(e))) => {
                    warn!(address = %addr, "selection failed for address: {e}");
                }
                Err(e) => warn!("selection task panicked: {e}"),
            }
        }
        Ok(result)
    }

    async fn select_for_address(
        &self,
        mut entry: crate::wallet::AddressEntry,
        ts: &Tipset,
    ) -> Result<MsgSelectResult, Error> {
        let mut out = MsgSelectResult::default();
        let shared = self.shared.read().clone();

        let actor = self.provider.state_get_actor(&entry.addr, ts.key()).await?;
        let mut modified = false;
        if actor.nonce > entry.nonce {
            // The chain is always the final authority on the next nonce.
            info!(
                address = %entry.addr,
                local = entry.nonce,
                chain = actor.nonce,
                "local nonce behind chain actor nonce, resynchronizing"
            );
            entry.nonce = actor.nonce;
            entry.updated_at = Utc::now();
            modified = true;
        }

        for msg in self.repo.list_filled_messages(&entry.addr)? {
            if msg.nonce() >= actor.nonce {
                match msg.signed_message() {
                    Some(smsg) => out.to_rebroadcast.push(smsg),
                    None => warn!(id = %msg.id, "filled message has no signature, cannot rebroadcast"),
                }
            }
        }

        let mut candidates = Vec::new();
        for mut msg in self.repo.list_unfilled_messages(&entry.addr)? {
            match msg.meta.expire_epoch {
                Some(expire) if expire <= ts.epoch() => {
                    msg.transition(MessageState::Expired)?;
                    out.expired.push(msg);
                }
                _ => candidates.push(msg),
            }
        }
        // Ascending expiry approximates oldest-commitment-first; unset
        // expiries sort last, creation time and id break ties.
        candidates.sort_by_key(|m| (m.meta.expire_epoch.unwrap_or(i64::MAX), m.created_at, m.id));

        if !candidates.is_empty() {
            match self.find_signer(&entry.addr).await? {
                None => {
                    debug!(address = %entry.addr, "no wallet can currently sign for address, skipping");
                }
                Some((wallet_name, wallet, relation)) => {
                    let max_pending = effective_sel_msg_num(&entry, &relation, &shared);
                    let gap = entry.nonce.saturating_sub(actor.nonce);
                    if gap >= max_pending {
                        debug!(
                            address = %entry.addr,
                            gap,
                            limit = max_pending,
                            "nonce gap at limit, applying back-pressure"
                        );
                    } else {
                        let budget = (max_pending - gap) as usize;
                        let (selected, fill_modified) = self
                            .fill_messages(
                                &mut entry,
                                candidates,
                                budget,
                                &shared,
                                &wallet_name,
                                &wallet,
                                ts,
                                &mut out,
                            )
                            .await;
                        modified |= fill_modified;
                        debug!(address = %entry.addr, selected, "address selection round finished");
                    }
                }
            }
        }

        metrics::ADDRESS_NONCE_GAP
            .get_or_create(&metrics::AddressLabel {
                address: entry.addr.to_string(),
            })
            .set(entry.nonce.saturating_sub(actor.nonce) as i64);
        if modified {
            out.modified.push(entry);
        }
        Ok(out)
    }

    /// Walks the ordered candidates, estimating, assigning and signing until
    /// the budget runs out. Isolated estimation failures skip to the next
    /// candidate; a bounded streak of consecutive failures, or any signing
    /// failure, abandons the rest of the address's round.
    #[allow(clippy::too_many_arguments)]
    async fn fill_messages(
        &self,
        entry: &mut crate::wallet::AddressEntry,
        candidates: Vec<Message>,
        budget: usize,
        shared: &SharedParams,
        wallet_name: &str,
        wallet: &Arc<dyn WalletApi>,
        ts: &Tipset,
        out: &mut MsgSelectResult,
    ) -> (usize, bool) {
        let mut selected = 0usize;
        let mut modified = false;
        let mut fail_streak = 0u32;
        for mut msg in candidates {
            if selected >= budget {
                break;
            }
            let spec = msg.meta.or(&entry.fee_spec).or(&shared.fee_spec);
            let mut unsigned = msg.message.clone();
            unsigned.sequence = entry.nonce;

            let mut estimated = match self
                .provider
                .gas_estimate_message_gas(&unsigned, &spec, ts.key())
                .await
            {
                Ok(estimated) => estimated,
                Err(e) => {
                    metrics::GAS_ESTIMATE_FAILURES.inc();
                    warn!(id = %msg.id, "gas estimation failed: {e}");
                    out.errors.push(MsgErrInfo {
                        id: msg.id,
                        error: e.to_string(),
                    });
                    fail_streak += 1;
                    if fail_streak >= self.estimate_fail_limit {
                        warn!(
                            address = %entry.addr,
                            failures = fail_streak,
                            "consecutive estimation failures, abandoning the rest of the round"
                        );
                        break;
                    }
                    continue;
                }
            };
            fail_streak = 0;

            apply_gas_overrides(&mut estimated, &spec);
            estimated.sequence = entry.nonce;
            msg.message = estimated;

            let unsigned_cid = match msg.unsigned_digest() {
                Ok(cid) => cid,
                Err(e) => {
                    out.errors.push(MsgErrInfo {
                        id: msg.id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let signature = match wallet.wallet_sign(&entry.addr, &unsigned_cid.to_bytes()).await
            {
                Ok(signature) => signature,
                Err(e) => {
                    warn!(
                        address = %entry.addr,
                        id = %msg.id,
                        "signing failed, abandoning the rest of the round: {e}"
                    );
                    out.errors.push(MsgErrInfo {
                        id: msg.id,
                        error: Error::Signing(e.to_string()).to_string(),
                    });
                    break;
                }
            };

            let smsg = SignedMessage::new_unchecked(msg.message.clone(), signature.clone());
            msg.signed_cid = match smsg.cid() {
                Ok(cid) => Some(cid),
                Err(e) => {
                    out.errors.push(MsgErrInfo {
                        id: msg.id,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            msg.unsigned_cid = Some(unsigned_cid);
            msg.signature = Some(signature);
            msg.wallet_name = wallet_name.to_owned();
            if let Err(e) = msg.transition(MessageState::Filled) {
                // UnFilled -> Filled is always declared; reaching this is a bug.
                out.errors.push(MsgErrInfo {
                    id: msg.id,
                    error: e.to_string(),
                });
                continue;
            }
            entry.nonce += 1;
            entry.updated_at = Utc::now();
            modified = true;
            selected += 1;
            out.selected.push(msg);
        }
        (selected, modified)
    }

    /// Finds a wallet that can currently sign for `addr`: an `Alive`
    /// relation whose client reports the key.
    pub(crate) async fn find_signer(
        &self,
        addr: &Address,
    ) -> Result<Option<(String, Arc<dyn WalletApi>, WalletAddress)>, Error> {
        for relation in self.repo.list_wallet_addresses_by_addr(addr)? {
            if !relation.addr_state.selectable() {
                continue;
            }
            let Some(wallet) = self.repo.get_wallet(&relation.wallet_id)? else {
                continue;
            };
            if wallet.is_deleted {
                continue;
            }
            let Some(api) = self.wallets.get(&wallet.name) else {
                continue;
            };
            match api.wallet_has(addr).await {
                Ok(true) => return Ok(Some((wallet.name, api, relation))),
                Ok(false) => continue,
                Err(e) => {
                    warn!(wallet = %wallet.name, "wallet availability check failed: {e}");
                    continue;
                }
            }
        }
        Ok(None)
    }
}

/// Address-level override wins, then the signing relation's, then the shared
/// default.
fn effective_sel_msg_num(
    entry: &crate::wallet::AddressEntry,
    relation: &WalletAddress,
    shared: &SharedParams,
) -> u64 {
    if entry.sel_msg_num > 0 {
        entry.sel_msg_num
    } else if relation.sel_msg_num > 0 {
        relation.sel_msg_num
    } else {
        shared.sel_msg_num
    }
}

/// Applies the merged fee policy to an estimated message: scales the gas
/// limit and premium, then bounds the worst-case fee.
fn apply_gas_overrides(msg: &mut UnsignedMessage, spec: &SendSpec) {
    if spec.gas_over_estimation > 0.0 {
        msg.gas_limit = (msg.gas_limit as f64 * spec.gas_over_estimation) as u64;
    }
    if spec.gas_over_premium > 0.0 {
        msg.gas_premium = scale_token(&msg.gas_premium, spec.gas_over_premium);
    }
    cap_gas_fee(msg, &spec.max_fee);
}

/// Caps `gas_fee_cap * gas_limit` at `max_fee`, pulling the premium down
/// with it when needed. A zero `max_fee` disables the cap.
pub(crate) fn cap_gas_fee(msg: &mut UnsignedMessage, max_fee: &TokenAmount) {
    if max_fee.is_zero() || msg.gas_limit == 0 {
        return;
    }
    let total = msg.gas_fee_cap.atto() * msg.gas_limit;
    if &total > max_fee.atto() {
        msg.gas_fee_cap = TokenAmount::from_atto(max_fee.atto() / BigInt::from(msg.gas_limit));
        if msg.gas_premium > msg.gas_fee_cap {
            msg.gas_premium = msg.gas_fee_cap.clone();
        }
    }
}

fn scale_token(amount: &TokenAmount, factor: f64) -> TokenAmount {
    let numerator = (factor * 10_000.0).round() as i64;
    TokenAmount::from_atto(amount.atto() * numerator / 10_000i64)
}
