// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The message service wires the engine together and owns its background
//! loops: head-change consumption, the serialized selection loop, wallet
//! reconciliation and the removing-relation drain.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::db::Repo;
use crate::errors::Error;
use crate::message::{
    Message, MessageState, SendSpec, SignedMessage, UnsignedMessage,
};
use crate::messager::config::{MessagerConfig, SharedParams};
use crate::messager::head_change::HeadChangeProcessor;
use crate::messager::metrics;
use crate::messager::msg_cache::MessageStateCache;
use crate::messager::provider::{MessagePublisher, Provider};
use crate::messager::reconciler::WalletReconciler;
use crate::messager::refresh::{MessageStateRefresher, SelectionTrigger};
use crate::messager::selection::{MessageSelector, MsgSelectResult};
use crate::messager::ts_cache::TipsetCache;
use crate::wallet::{AddressEntry, AddressState, WalletHandle, WalletRegistry};

const REPLACE_BY_FEE_RATIO: f32 = 1.25;
const RBF_NUM: u64 = ((REPLACE_BY_FEE_RATIO - 1f32) * 256f32) as u64;
const RBF_DENOM: u64 = 256;

const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Gas overrides for [`MessageService::replace_message`]. With `auto`, gas is
/// re-estimated and the premium bumped past the replace-by-fee minimum;
/// otherwise the explicitly set fields are applied as-is.
#[derive(Debug, Clone, Default)]
pub struct ReplaceSpec {
    pub auto: bool,
    pub max_fee: TokenAmount,
    pub gas_limit: u64,
    pub gas_premium: TokenAmount,
    pub gas_fee_cap: TokenAmount,
}

pub struct MessageService {
    repo: Arc<dyn Repo>,
    provider: Arc<dyn Provider>,
    publisher: Arc<dyn MessagePublisher>,
    cfg: MessagerConfig,
    shared: Arc<RwLock<SharedParams>>,
    msg_cache: Arc<MessageStateCache>,
    ts_cache: Arc<TipsetCache>,
    selector: MessageSelector,
    refresher: Arc<MessageStateRefresher>,
    reconciler: Arc<WalletReconciler>,
    trigger: Arc<SelectionTrigger>,
    trigger_rx: flume::Receiver<()>,
    ctx: CancellationToken,
}

impl MessageService {
    pub async fn new(
        cfg: MessagerConfig,
        repo: Arc<dyn Repo>,
        provider: Arc<dyn Provider>,
        publisher: Arc<dyn MessagePublisher>,
        wallet_handles: Vec<WalletHandle>,
    ) -> Result<Arc<Self>, Error> {
        let network_name = provider.state_network_name().await?;
        let ts_cache = Arc::new(TipsetCache::load(
            cfg.tipset_cache_capacity,
            cfg.tipset_cache_path.clone(),
            network_name,
        ));
        let msg_cache = Arc::new(MessageStateCache::new(
            cfg.msg_cache_size,
            cfg.msg_cache_ttl(),
            repo.clone(),
        ));
        let shared = Arc::new(RwLock::new(SharedParams::default()));
        let wallets = Arc::new(WalletRegistry::new(wallet_handles));
        let (trigger, trigger_rx) = SelectionTrigger::new();
        let selector = MessageSelector::new(
            repo.clone(),
            provider.clone(),
            wallets.clone(),
            shared.clone(),
            &cfg,
        );
        let refresher = Arc::new(MessageStateRefresher::new(
            repo.clone(),
            provider.clone(),
            msg_cache.clone(),
            ts_cache.clone(),
            trigger.clone(),
            cfg.sel_trigger_delay(),
        ));
        let reconciler = Arc::new(WalletReconciler::new(
            repo.clone(),
            provider.clone(),
            wallets,
            msg_cache.clone(),
            shared.clone(),
            cfg.drain_interval(),
        ));
        Ok(Arc::new(MessageService {
            repo,
            provider,
            publisher,
            cfg,
            shared,
            msg_cache,
            ts_cache,
            selector,
            refresher,
            reconciler,
            trigger,
            trigger_rx,
            ctx: CancellationToken::new(),
        }))
    }

    /// Spawns the background loops. The head-change processor is the single
    /// consumer of chain notifications; the selection loop serializes rounds
    /// globally.
    pub fn start(self: &Arc<Self>, services: &mut JoinSet<anyhow::Result<()>>) {
        let processor = Arc::new(HeadChangeProcessor::new(
            self.provider.clone(),
            self.ts_cache.clone(),
            self.refresher.clone(),
        ));
        services.spawn(processor.run(self.ctx.child_token()));

        let service = self.clone();
        let trigger_rx = self.trigger_rx.clone();
        services.spawn(async move { service.run_selection_loop(trigger_rx).await });

        services.spawn(self.reconciler.clone().run_scan_loop(self.ctx.child_token()));
        services.spawn(self.reconciler.clone().run_drain_loop(self.ctx.child_token()));
    }

    /// Signals every loop to exit.
    pub fn shutdown(&self) {
        self.trigger.cancel();
        self.ctx.cancel();
    }

    async fn run_selection_loop(
        self: Arc<Self>,
        trigger_rx: flume::Receiver<()>,
    ) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.cfg.sel_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.ctx.cancelled() => return Ok(()),
                _ = trigger_rx.recv_async() => {}
                _ = interval.tick() => {}
            }
            // One round completes, including persistence, before the next
            // trigger is consumed; this serialization protects the nonce
            // invariant.
            if let Err(e) = self.run_selection_round().await {
                warn!("selection round failed: {e}");
            }
        }
    }

    /// Runs one selection round against the current head: select, persist,
    /// then broadcast. Signing success is durable before any message is
    /// announced externally.
    pub async fn run_selection_round(&self) -> Result<(), Error> {
        let head = self.provider.chain_head().await?;
        let result = self.selector.select_message(&head).await?;
        self.persist_selection(&result)?;

        for msg in result.selected.iter().chain(result.expired.iter()) {
            self.msg_cache.set(msg.clone());
        }
        metrics::MESSAGES_SELECTED.inc_by(result.selected.len() as u64);
        metrics::MESSAGES_EXPIRED.inc_by(result.expired.len() as u64);

        for msg in &result.selected {
            if let Some(smsg) = msg.signed_message()
                && let Err(e) = self.publisher.publish(&smsg).await
            {
                warn!(id = %msg.id, "broadcast failed: {e}");
            }
        }
        for smsg in &result.to_rebroadcast {
            if let Err(e) = self.publisher.publish(smsg).await {
                warn!("rebroadcast failed: {e}");
            }
        }
        Ok(())
    }

    fn persist_selection(&self, result: &MsgSelectResult) -> Result<(), Error> {
        if result.selected.is_empty() && result.expired.is_empty() && result.modified.is_empty()
        {
            return Ok(());
        }
        self.repo.transaction(&mut |tx| {
            for msg in result.selected.iter().chain(result.expired.iter()) {
                tx.save_message(msg)?;
            }
            for entry in &result.modified {
                tx.save_address(entry)?;
            }
            Ok(())
        })
    }

    /// Accepts a message for management. The sender must be a managed,
    /// selectable address.
    pub async fn push_message(&self, msg: UnsignedMessage, meta: SendSpec) -> Result<Uuid, Error> {
        self.push_message_with_id(Uuid::new_v4(), msg, meta).await
    }

    pub async fn push_message_with_id(
        &self,
        id: Uuid,
        msg: UnsignedMessage,
        meta: SendSpec,
    ) -> Result<Uuid, Error> {
        let entry = self
            .repo
            .get_address(&msg.from)?
            .ok_or(Error::AddressNotFound(msg.from))?;
        if !entry.state.selectable() {
            return Err(Error::AddressNotSelectable(msg.from));
        }
        let wallet_name = self
            .repo
            .list_wallet_addresses_by_addr(&msg.from)?
            .iter()
            .filter(|rel| rel.addr_state.selectable())
            .find_map(|rel| self.repo.get_wallet(&rel.wallet_id).ok().flatten())
            .map(|wallet| wallet.name)
            .unwrap_or_default();
        let message = Message::with_id(id, msg, meta, wallet_name);
        self.repo.create_message(&message)?;
        self.msg_cache.set(message);
        self.trigger.fire();
        Ok(id)
    }

    pub fn get_message(&self, id: &Uuid) -> Result<Message, Error> {
        self.msg_cache
            .get(id)?
            .ok_or(Error::MessageNotFound(*id))
    }

    pub fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Message, Error> {
        self.msg_cache
            .get_by_signed_cid(cid)?
            .ok_or_else(|| Error::Other(format!("no message with signed cid {cid}")))
    }

    pub fn list_messages_by_address(&self, addr: &Address) -> Result<Vec<Message>, Error> {
        self.repo.list_messages_by_address(addr)
    }

    pub fn list_failed_messages(&self) -> Result<Vec<Message>, Error> {
        self.repo.list_messages_by_state(MessageState::Failed)
    }

    /// Manually fails a filled message so its nonce slot can be reused by a
    /// replacement.
    pub fn mark_bad_message(&self, id: &Uuid) -> Result<Message, Error> {
        let mut msg = self.get_message(id)?;
        msg.transition(MessageState::Failed)?;
        self.repo.save_message(&msg)?;
        self.msg_cache.set(msg.clone());
        Ok(msg)
    }

    /// Re-estimates, re-signs and republishes a filled message under its
    /// existing nonce. Returns the new signed digest.
    pub async fn replace_message(&self, id: &Uuid, spec: ReplaceSpec) -> Result<Cid, Error> {
        let mut msg = self.get_message(id)?;
        if msg.state != MessageState::Filled {
            return Err(Error::Unreplaceable {
                id: *id,
                state: msg.state,
            });
        }
        let head = self.provider.chain_head().await?;
        let old_premium = msg.message.gas_premium.clone();

        if spec.auto {
            let estimated = self
                .provider
                .gas_estimate_message_gas(&msg.message, &msg.meta, head.key())
                .await
                .map_err(|e| Error::GasEstimation(e.to_string()))?;
            msg.message.gas_limit = estimated.gas_limit;
            msg.message.gas_premium = estimated.gas_premium;
            msg.message.gas_fee_cap = estimated.gas_fee_cap;
        } else {
            if spec.gas_limit > 0 {
                msg.message.gas_limit = spec.gas_limit;
            }
            if !spec.gas_premium.is_zero() {
                msg.message.gas_premium = spec.gas_premium.clone();
            }
            if !spec.gas_fee_cap.is_zero() {
                msg.message.gas_fee_cap = spec.gas_fee_cap.clone();
            }
        }

        // The network drops a same-nonce message unless its premium rises by
        // the replace-by-fee ratio.
        let min_premium = min_rbf_premium(&old_premium);
        if msg.message.gas_premium < min_premium {
            if spec.auto {
                msg.message.gas_premium = min_premium.clone();
                if msg.message.gas_fee_cap < min_premium {
                    msg.message.gas_fee_cap = min_premium;
                }
            } else {
                return Err(Error::GasPremiumTooLow {
                    premium: msg.message.gas_premium.to_string(),
                    min: min_premium.to_string(),
                });
            }
        }
        if !spec.max_fee.is_zero() {
            crate::messager::selection::cap_gas_fee(&mut msg.message, &spec.max_fee);
        }

        let (wallet_name, wallet, _) = self
            .selector
            .find_signer(&msg.from_addr())
            .await?
            .ok_or_else(|| Error::WalletNotFound(msg.wallet_name.clone()))?;
        let unsigned_cid = msg.unsigned_digest()?;
        let signature = wallet
            .wallet_sign(&msg.from_addr(), &unsigned_cid.to_bytes())
            .await
            .map_err(|e| Error::Signing(e.to_string()))?;

        msg.unsigned_cid = Some(unsigned_cid);
        msg.signature = Some(signature.clone());
        let smsg = SignedMessage::new_unchecked(msg.message.clone(), signature);
        let signed_cid = smsg.cid()?;
        msg.signed_cid = Some(signed_cid);
        msg.wallet_name = wallet_name;
        msg.updated_at = Utc::now();

        self.repo.save_message(&msg)?;
        self.msg_cache.set(msg);
        if let Err(e) = self.publisher.publish(&smsg).await {
            warn!("broadcast of replacement failed: {e}");
        }
        Ok(signed_cid)
    }

    /// Resolves once the message is on chain with `confidence` epochs on top
    /// of its inclusion height, or immediately on a terminal state.
    pub async fn wait_message(&self, id: &Uuid, confidence: u64) -> Result<Message, Error> {
        loop {
            let msg = self.get_message(id)?;
            if msg.state.is_terminal() {
                return Ok(msg);
            }
            if msg.state == MessageState::OnChain {
                let head = self.provider.chain_head().await?;
                if head.epoch() >= msg.height + confidence as ChainEpoch {
                    return Ok(msg);
                }
            }
            tokio::select! {
                _ = self.ctx.cancelled() => {
                    return Err(Error::Other("service shutting down".into()));
                }
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
            }
        }
    }

    /// Operator action: stop selecting for an address without dropping its
    /// pending messages.
    pub fn forbid_address(&self, addr: &Address) -> Result<(), Error> {
        self.flip_address(addr, AddressState::Alive, AddressState::Forbidden)
    }

    /// Operator action: resume selecting for a forbidden address.
    pub fn permit_address(&self, addr: &Address) -> Result<(), Error> {
        self.flip_address(addr, AddressState::Forbidden, AddressState::Alive)
    }

    fn flip_address(
        &self,
        addr: &Address,
        from: AddressState,
        to: AddressState,
    ) -> Result<(), Error> {
        let mut entry = self
            .repo
            .get_address(addr)?
            .ok_or(Error::AddressNotFound(*addr))?;
        if entry.state == to {
            return Ok(());
        }
        if entry.state != from {
            return Err(Error::Other(format!(
                "address {addr} is {}, expected {from}",
                entry.state
            )));
        }
        entry.state = to;
        entry.updated_at = Utc::now();
        self.repo.save_address(&entry)?;
        for mut rel in self.repo.list_wallet_addresses_by_addr(addr)? {
            if rel.addr_state == from {
                rel.addr_state = to;
                rel.updated_at = Utc::now();
                self.repo.save_wallet_address(&rel)?;
            }
        }
        Ok(())
    }

    pub fn set_sel_msg_num(&self, addr: &Address, num: u64) -> Result<(), Error> {
        let mut entry = self
            .repo
            .get_address(addr)?
            .ok_or(Error::AddressNotFound(*addr))?;
        entry.sel_msg_num = num;
        entry.updated_at = Utc::now();
        self.repo.save_address(&entry)
    }

    pub fn set_fee_params(&self, addr: &Address, fee_spec: SendSpec) -> Result<(), Error> {
        let mut entry = self
            .repo
            .get_address(addr)?
            .ok_or(Error::AddressNotFound(*addr))?;
        entry.fee_spec = fee_spec;
        entry.updated_at = Utc::now();
        self.repo.save_address(&entry)
    }

    /// The ledger view: operators read per-address nonce backlog here.
    pub fn list_addresses(&self) -> Result<Vec<AddressEntry>, Error> {
        self.repo.list_addresses()
    }

    pub fn set_shared_params(&self, params: SharedParams) {
        *self.shared.write() = params;
    }

    pub fn shared_params(&self) -> SharedParams {
        self.shared.read().clone()
    }
}

/// Minimum premium a replacement must carry: the old premium bumped by the
/// replace-by-fee ratio, plus one atto.
fn min_rbf_premium(premium: &TokenAmount) -> TokenAmount {
    TokenAmount::from_atto(premium.atto() + premium.atto() * RBF_NUM / RBF_DENOM + 1u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{
        AddressRepo, MemRepo, MessageRepo, WalletAddressRepo, WalletRepo,
    };
    use crate::messager::test_provider::{
        TestApi, TestPublisher, TestWallet, mock_tipset, mock_unsigned,
    };
    use crate::wallet::{Wallet, WalletAddress};

    struct Harness {
        repo: Arc<MemRepo>,
        api: Arc<TestApi>,
        publisher: Arc<TestPublisher>,
        service: Arc<MessageService>,
        addr: Address,
        _dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        let repo = Arc::new(MemRepo::new());
        let api = Arc::new(TestApi::default());
        let publisher = Arc::new(TestPublisher::new());
        let addr = Address::new_id(1);
        let wallet = Arc::new(TestWallet::new([addr]));

        let dir = tempfile::tempdir().unwrap();
        let cfg = MessagerConfig {
            tipset_cache_path: dir.path().join("tipset_cache.json"),
            ..Default::default()
        };
        let service = MessageService::new(
            cfg,
            repo.clone(),
            api.clone(),
            publisher.clone(),
            vec![WalletHandle {
                name: "w1".into(),
                api: wallet,
            }],
        )
        .await
        .unwrap();

        let w = Wallet::new("w1".into());
        repo.save_wallet(&w).unwrap();
        repo.save_wallet_address(&WalletAddress::new(w.id, addr)).unwrap();
        repo.save_address(&AddressEntry::new(addr, 5)).unwrap();
        api.set_actor(addr, 5, 1_000_000_000);

        let mut ts = mock_tipset(None, 0);
        for _ in 0..20 {
            ts = mock_tipset(Some(&ts), 0);
        }
        api.set_head(ts);

        Harness {
            repo,
            api,
            publisher,
            service,
            addr,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn round_fills_persists_then_broadcasts() {
        let h = harness().await;
        let id_a = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        let id_b = h
            .service
            .push_message(mock_unsigned(h.addr, 101, 0), SendSpec::default())
            .await
            .unwrap();

        h.service.run_selection_round().await.unwrap();

        let a = h.repo.get_message(&id_a).unwrap().unwrap();
        let b = h.repo.get_message(&id_b).unwrap().unwrap();
        assert_eq!(a.state, MessageState::Filled);
        assert_eq!(b.state, MessageState::Filled);
        let mut nonces = vec![a.nonce(), b.nonce()];
        nonces.sort_unstable();
        assert_eq!(nonces, vec![5, 6]);
        assert_eq!(
            h.repo.get_address(&h.addr).unwrap().unwrap().nonce,
            7,
            "ledger nonce advanced and persisted"
        );
        assert_eq!(h.publisher.published_count(), 2);
    }

    #[tokio::test]
    async fn repeated_round_does_not_double_assign() {
        let h = harness().await;
        h.service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        h.service.run_selection_round().await.unwrap();
        let nonce_after_first = h.repo.get_address(&h.addr).unwrap().unwrap().nonce;

        // Same head, no refresh in between: the second round only
        // rebroadcasts, it must not consume another nonce.
        h.service.run_selection_round().await.unwrap();
        assert_eq!(
            h.repo.get_address(&h.addr).unwrap().unwrap().nonce,
            nonce_after_first
        );
        let filled = h.repo.list_filled_messages(&h.addr).unwrap();
        assert_eq!(filled.len(), 1);
        // first round published the fill, second round the rebroadcast
        assert_eq!(h.publisher.published_count(), 2);
    }

    #[tokio::test]
    async fn push_requires_managed_selectable_address() {
        let h = harness().await;
        let stranger = Address::new_id(42);
        let err = h
            .service
            .push_message(mock_unsigned(stranger, 100, 0), SendSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressNotFound(_)));

        h.service.forbid_address(&h.addr).unwrap();
        let err = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressNotSelectable(_)));

        h.service.permit_address(&h.addr).unwrap();
        h.service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn forbidden_address_is_not_selected() {
        let h = harness().await;
        h.service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        h.service.forbid_address(&h.addr).unwrap();
        h.service.run_selection_round().await.unwrap();
        assert!(h.repo.list_filled_messages(&h.addr).unwrap().is_empty());
        assert_eq!(h.publisher.published_count(), 0);
    }

    #[tokio::test]
    async fn mark_bad_fails_a_filled_message_only() {
        let h = harness().await;
        let id = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        // UnFilled messages own no nonce, there is nothing to mark bad yet.
        assert!(matches!(
            h.service.mark_bad_message(&id),
            Err(Error::InvalidStateTransition { .. })
        ));

        h.service.run_selection_round().await.unwrap();
        let failed = h.service.mark_bad_message(&id).unwrap();
        assert_eq!(failed.state, MessageState::Failed);
        assert_eq!(
            h.repo.get_message(&id).unwrap().unwrap().state,
            MessageState::Failed
        );
    }

    #[tokio::test]
    async fn replace_bumps_premium_and_republished() {
        let h = harness().await;
        let id = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        h.service.run_selection_round().await.unwrap();
        let before = h.repo.get_message(&id).unwrap().unwrap();
        let published_before = h.publisher.published_count();

        let new_cid = h
            .service
            .replace_message(
                &id,
                ReplaceSpec {
                    auto: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let after = h.repo.get_message(&id).unwrap().unwrap();
        assert_eq!(after.state, MessageState::Filled);
        assert_eq!(after.nonce(), before.nonce(), "nonce must not change");
        assert!(after.message.gas_premium >= min_rbf_premium(&before.message.gas_premium));
        assert_ne!(after.signed_cid, before.signed_cid);
        assert_eq!(after.signed_cid, Some(new_cid));
        assert_eq!(h.publisher.published_count(), published_before + 1);
    }

    #[tokio::test]
    async fn replace_rejects_low_manual_premium() {
        let h = harness().await;
        let id = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        h.service.run_selection_round().await.unwrap();

        let err = h
            .service
            .replace_message(
                &id,
                ReplaceSpec {
                    auto: false,
                    gas_premium: TokenAmount::from_atto(1u64),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::GasPremiumTooLow { .. }));
    }

    #[tokio::test]
    async fn replace_requires_filled_state() {
        let h = harness().await;
        let id = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        let err = h
            .service
            .replace_message(&id, ReplaceSpec::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unreplaceable { .. }));
    }

    #[tokio::test]
    async fn wait_message_resolves_on_confidence_and_terminal_states() {
        let h = harness().await;
        let id = h
            .service
            .push_message(mock_unsigned(h.addr, 100, 0), SendSpec::default())
            .await
            .unwrap();
        h.service.run_selection_round().await.unwrap();

        // Confirm well below the head so one poll suffices.
        let mut msg = h.repo.get_message(&id).unwrap().unwrap();
        msg.transition(MessageState::OnChain).unwrap();
        msg.height = 2;
        h.repo.save_message(&msg).unwrap();
        h.service.msg_cache.set(msg);

        let confirmed = h.service.wait_message(&id, 3).await.unwrap();
        assert_eq!(confirmed.state, MessageState::OnChain);

        let mut failed = h.repo.get_message(&id).unwrap().unwrap();
        failed.transition(MessageState::Replaced).unwrap();
        h.repo.save_message(&failed).unwrap();
        h.service.msg_cache.set(failed);
        let terminal = h.service.wait_message(&id, 100).await.unwrap();
        assert_eq!(terminal.state, MessageState::Replaced);
    }

    #[tokio::test]
    async fn shared_params_are_adjustable_at_runtime() {
        let h = harness().await;
        let mut params = h.service.shared_params();
        params.sel_msg_num = 1;
        h.service.set_shared_params(params);

        for i in 0..3 {
            h.service
                .push_message(mock_unsigned(h.addr, 100 + i, 0), SendSpec::default())
                .await
                .unwrap();
        }
        h.service.run_selection_round().await.unwrap();
        assert_eq!(
            h.repo.list_filled_messages(&h.addr).unwrap().len(),
            1,
            "shared cap of one bounds the round"
        );
    }

    #[test]
    fn rbf_minimum_is_a_quarter_bump() {
        let min = min_rbf_premium(&TokenAmount::from_atto(1000u64));
        assert_eq!(min, TokenAmount::from_atto(1251u64));
    }
}
