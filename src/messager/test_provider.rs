// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Chain, wallet and transport doubles used across the messager tests.

use std::sync::Arc;

use ahash::{HashMap, HashSet};
use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::RawBytes;
use fvm_shared::address::Address;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use num_traits::Zero;
use parking_lot::{Mutex, RwLock};

use crate::blocks::{Tipset, TipsetKey};
use crate::errors::Error;
use crate::message::{
    Message, MessageReceipt, SendSpec, SignedMessage, UnsignedMessage,
};
use crate::messager::provider::{ActorState, HeadChange, MessagePublisher, Provider};
use crate::utils::cid_from_cbor;
use crate::wallet::WalletApi;

/// Chain node double.
pub struct TestApi {
    tipsets: RwLock<HashMap<TipsetKey, Arc<Tipset>>>,
    head: RwLock<Option<Arc<Tipset>>>,
    actors: RwLock<HashMap<Address, ActorState>>,
    parent_msgs: RwLock<HashMap<Cid, Vec<UnsignedMessage>>>,
    parent_receipts: RwLock<HashMap<Cid, Vec<MessageReceipt>>>,
    estimate_failures: RwLock<HashSet<Address>>,
    network_name: String,
    head_tx: flume::Sender<Vec<HeadChange>>,
    head_rx: flume::Receiver<Vec<HeadChange>>,
}

impl Default for TestApi {
    fn default() -> Self {
        Self::new("testnet")
    }
}

impl TestApi {
    pub fn new(network_name: &str) -> Self {
        let (head_tx, head_rx) = flume::bounded(16);
        TestApi {
            tipsets: RwLock::new(HashMap::default()),
            head: RwLock::new(None),
            actors: RwLock::new(HashMap::default()),
            parent_msgs: RwLock::new(HashMap::default()),
            parent_receipts: RwLock::new(HashMap::default()),
            estimate_failures: RwLock::new(HashSet::default()),
            network_name: network_name.to_owned(),
            head_tx,
            head_rx,
        }
    }

    pub fn set_actor(&self, addr: Address, nonce: u64, balance: u64) {
        self.actors.write().insert(
            addr,
            ActorState {
                nonce,
                balance: TokenAmount::from_atto(balance),
            },
        );
    }

    pub fn register_tipset(&self, ts: Arc<Tipset>) {
        self.tipsets.write().insert(ts.key().clone(), ts);
    }

    pub fn set_head(&self, ts: Arc<Tipset>) {
        self.register_tipset(ts.clone());
        *self.head.write() = Some(ts);
    }

    pub fn publish_head_changes(&self, batch: Vec<HeadChange>) {
        self.head_tx.send(batch).expect("head change receiver alive");
    }

    /// Registers paired parent messages and receipts for a block.
    pub fn set_parent_messages(
        &self,
        block: Cid,
        entries: Vec<(UnsignedMessage, MessageReceipt)>,
    ) {
        let (msgs, receipts) = entries.into_iter().unzip();
        self.set_parent_messages_raw(block, msgs, receipts);
    }

    /// Registers parent messages and receipts independently, allowing
    /// deliberately mismatched lengths.
    pub fn set_parent_messages_raw(
        &self,
        block: Cid,
        msgs: Vec<UnsignedMessage>,
        receipts: Vec<MessageReceipt>,
    ) {
        self.parent_msgs.write().insert(block, msgs);
        self.parent_receipts.write().insert(block, receipts);
    }

    pub fn fail_estimation(&self, addr: Address, fail: bool) {
        if fail {
            self.estimate_failures.write().insert(addr);
        } else {
            self.estimate_failures.write().remove(&addr);
        }
    }
}

#[async_trait]
impl Provider for TestApi {
    fn subscribe_head_changes(&self) -> flume::Receiver<Vec<HeadChange>> {
        self.head_rx.clone()
    }

    async fn chain_head(&self) -> Result<Arc<Tipset>, Error> {
        self.head
            .read()
            .clone()
            .ok_or_else(|| Error::Other("no chain head set".into()))
    }

    async fn load_tipset(&self, key: &TipsetKey) -> Result<Arc<Tipset>, Error> {
        self.tipsets
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::Other(format!("tipset {key} not found")))
    }

    async fn state_get_actor(
        &self,
        addr: &Address,
        _ts: &TipsetKey,
    ) -> Result<ActorState, Error> {
        self.actors
            .read()
            .get(addr)
            .cloned()
            .ok_or_else(|| Error::Other(format!("actor {addr} not found")))
    }

    async fn chain_get_parent_messages(
        &self,
        block: &Cid,
    ) -> Result<Vec<UnsignedMessage>, Error> {
        Ok(self.parent_msgs.read().get(block).cloned().unwrap_or_default())
    }

    async fn chain_get_parent_receipts(
        &self,
        block: &Cid,
    ) -> Result<Vec<MessageReceipt>, Error> {
        Ok(self
            .parent_receipts
            .read()
            .get(block)
            .cloned()
            .unwrap_or_default())
    }

    async fn gas_estimate_message_gas(
        &self,
        msg: &UnsignedMessage,
        _spec: &SendSpec,
        _ts: &TipsetKey,
    ) -> Result<UnsignedMessage, Error> {
        if self.estimate_failures.read().contains(&msg.from) {
            return Err(Error::GasEstimation("forced failure".into()));
        }
        let mut est = msg.clone();
        if est.gas_limit == 0 {
            est.gas_limit = 1_000_000;
        }
        if est.gas_premium.is_zero() {
            est.gas_premium = TokenAmount::from_atto(100u64);
        }
        if est.gas_fee_cap.is_zero() {
            est.gas_fee_cap = TokenAmount::from_atto(200u64);
        }
        Ok(est)
    }

    async fn state_network_name(&self) -> Result<String, Error> {
        Ok(self.network_name.clone())
    }
}

/// Wallet double. Signatures are secp-shaped and deterministic over the
/// signed bytes, so distinct digests produce distinct signatures.
pub struct TestWallet {
    keys: RwLock<HashSet<Address>>,
    fail_signing: RwLock<bool>,
}

impl TestWallet {
    pub fn new(keys: impl IntoIterator<Item = Address>) -> Self {
        TestWallet {
            keys: RwLock::new(keys.into_iter().collect()),
            fail_signing: RwLock::new(false),
        }
    }

    pub fn add_key(&self, addr: Address) {
        self.keys.write().insert(addr);
    }

    pub fn remove_key(&self, addr: &Address) {
        self.keys.write().remove(addr);
    }

    pub fn set_fail_signing(&self, fail: bool) {
        *self.fail_signing.write() = fail;
    }
}

#[async_trait]
impl WalletApi for TestWallet {
    async fn wallet_list(&self) -> anyhow::Result<Vec<Address>> {
        let mut keys: Vec<Address> = self.keys.read().iter().copied().collect();
        keys.sort_by_key(|a| a.to_string());
        Ok(keys)
    }

    async fn wallet_has(&self, addr: &Address) -> anyhow::Result<bool> {
        Ok(self.keys.read().contains(addr))
    }

    async fn wallet_sign(&self, addr: &Address, data: &[u8]) -> anyhow::Result<Signature> {
        if *self.fail_signing.read() {
            anyhow::bail!("signer unavailable");
        }
        if !self.keys.read().contains(addr) {
            anyhow::bail!("key not found: {addr}");
        }
        Ok(Signature::new_secp256k1(data.to_vec()))
    }
}

/// Transport double that records every published message.
#[derive(Default)]
pub struct TestPublisher {
    pub published: Mutex<Vec<SignedMessage>>,
}

impl TestPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }
}

#[async_trait]
impl MessagePublisher for TestPublisher {
    async fn publish(&self, msg: &SignedMessage) -> anyhow::Result<()> {
        self.published.lock().push(msg.clone());
        Ok(())
    }
}

/// A mock tipset chained onto `parent`; `salt` differentiates forks at the
/// same height.
pub fn mock_tipset(parent: Option<&Tipset>, salt: u64) -> Arc<Tipset> {
    let epoch = parent.map_or(0, |p| p.epoch() + 1);
    let key = TipsetKey::new(vec![cid_from_cbor(&("tipset", epoch, salt)).unwrap()]);
    let parents = parent.map(|p| p.key().clone()).unwrap_or_default();
    Arc::new(Tipset::new(key, parents, epoch))
}

/// Builds a linked chain of `len` tipsets starting at epoch 0 and registers
/// every one with the api.
pub fn mock_chain(api: &TestApi, len: usize) -> Vec<Arc<Tipset>> {
    let mut out = Vec::with_capacity(len);
    let mut parent: Option<Arc<Tipset>> = None;
    for _ in 0..len {
        let ts = mock_tipset(parent.as_deref(), 0);
        api.register_tipset(ts.clone());
        out.push(ts.clone());
        parent = Some(ts);
    }
    out
}

pub fn mock_unsigned(from: Address, to: u64, nonce: u64) -> UnsignedMessage {
    UnsignedMessage {
        version: 0,
        from,
        to: Address::new_id(to),
        sequence: nonce,
        value: TokenAmount::zero(),
        method_num: 0,
        params: RawBytes::default(),
        gas_limit: 0,
        gas_fee_cap: TokenAmount::zero(),
        gas_premium: TokenAmount::zero(),
    }
}

pub fn mock_message(from: Address, nonce: u64) -> Message {
    Message::new(mock_unsigned(from, 100, nonce), SendSpec::default(), "w1".into())
}
