// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Boundary traits toward the chain node and the gossip transport. The
//! messager interacts with some medium implementing [`Provider`] for all
//! chain reads and with a [`MessagePublisher`] for broadcasting signed
//! messages.

use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::econ::TokenAmount;

use crate::blocks::{Tipset, TipsetKey};
use crate::errors::Error;
use crate::message::{MessageReceipt, SendSpec, SignedMessage, UnsignedMessage};

/// State of an actor as reported by the chain node. The chain's nonce is
/// always the final authority on the next expected nonce.
#[derive(Debug, Clone, PartialEq)]
pub struct ActorState {
    pub nonce: u64,
    pub balance: TokenAmount,
}

/// One element of a head-change notification batch. The first batch of a
/// subscription is always a single `Current` snapshot.
#[derive(Debug, Clone)]
pub enum HeadChange {
    Current(Arc<Tipset>),
    Apply(Arc<Tipset>),
    Revert(Arc<Tipset>),
}

/// Chain node boundary.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Subscribes to ordered head-change batches.
    fn subscribe_head_changes(&self) -> flume::Receiver<Vec<HeadChange>>;
    /// The heaviest tipset the node currently knows.
    async fn chain_head(&self) -> Result<Arc<Tipset>, Error>;
    /// Loads a tipset by key.
    async fn load_tipset(&self, key: &TipsetKey) -> Result<Arc<Tipset>, Error>;
    /// Authoritative nonce and balance of an actor at the given tipset.
    async fn state_get_actor(&self, addr: &Address, ts: &TipsetKey)
    -> Result<ActorState, Error>;
    /// Messages executed by the parent of the given block.
    async fn chain_get_parent_messages(&self, block: &Cid)
    -> Result<Vec<UnsignedMessage>, Error>;
    /// Receipts paired by position with [`Provider::chain_get_parent_messages`].
    async fn chain_get_parent_receipts(&self, block: &Cid)
    -> Result<Vec<MessageReceipt>, Error>;
    /// Estimates the gas fields of a message against the given tipset,
    /// advised by the caller's fee policy.
    async fn gas_estimate_message_gas(
        &self,
        msg: &UnsignedMessage,
        spec: &SendSpec,
        ts: &TipsetKey,
    ) -> Result<UnsignedMessage, Error>;
    /// The network name the node is following.
    async fn state_network_name(&self) -> Result<String, Error>;
}

/// Message to be sent over the network by the transport layer.
#[derive(Debug, Clone)]
pub enum NetworkMessage {
    PubsubMessage { topic: String, message: Vec<u8> },
}

/// Fire-and-forget broadcast boundary. Failures are logged by the caller and
/// never fatal: chain inclusion can also occur via other propagation paths.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, msg: &SignedMessage) -> anyhow::Result<()>;
}

pub const PUBSUB_MSG_STR: &str = "/fil/msgs";

/// Default publisher: pushes CBOR-encoded signed messages onto the pubsub
/// topic of the configured network.
pub struct PubsubPublisher {
    topic: String,
    sender: flume::Sender<NetworkMessage>,
}

impl PubsubPublisher {
    pub fn new(network_name: &str, sender: flume::Sender<NetworkMessage>) -> Self {
        PubsubPublisher {
            topic: format!("{PUBSUB_MSG_STR}/{network_name}"),
            sender,
        }
    }
}

#[async_trait]
impl MessagePublisher for PubsubPublisher {
    async fn publish(&self, msg: &SignedMessage) -> anyhow::Result<()> {
        let message = fvm_ipld_encoding::to_vec(msg)?;
        self.sender
            .send_async(NetworkMessage::PubsubMessage {
                topic: self.topic.clone(),
                message,
            })
            .await
            .map_err(|_| anyhow::anyhow!("network receiver dropped"))
    }
}
