// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The message entity managed by the pool, its lifecycle state machine and
//! the fee policy attached to it.

mod signed_message;

use chrono::{DateTime, Utc};
use cid::Cid;
use fvm_shared::clock::ChainEpoch;
use fvm_shared::crypto::signature::Signature;
use fvm_shared::econ::TokenAmount;
use fvm_ipld_encoding::RawBytes;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use fvm_shared::message::Message as UnsignedMessage;
pub use signed_message::SignedMessage;

use crate::blocks::TipsetKey;
use crate::errors::Error;
use crate::utils::cid_from_cbor;

/// Lifecycle state of a pool message.
///
/// `UnFilled` messages own no nonce yet; `Filled` messages are signed and
/// carry a nonce; `OnChain` messages additionally carry a receipt and an
/// inclusion height. All other states are terminal.
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
pub enum MessageState {
    UnFilled,
    Filled,
    OnChain,
    Failed,
    Replaced,
    Expired,
    NoWallet,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        use MessageState::*;
        matches!(self, Failed | Replaced | Expired | NoWallet)
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(self, to: MessageState) -> bool {
        use MessageState::*;
        matches!(
            (self, to),
            (UnFilled, Filled)
                | (Filled, OnChain)
                | (OnChain, Filled)
                | (UnFilled, Expired)
                | (Filled, Expired)
                | (Filled, Failed)
                | (Filled, Replaced)
                | (OnChain, Replaced)
                | (UnFilled, NoWallet)
                | (Filled, NoWallet)
        )
    }
}

/// Fee policy and expiry attached to a message, an address, or the shared
/// runtime parameters. Zero values mean "unset, defer to the next layer";
/// merge precedence is per-message, then per-address, then shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendSpec {
    /// Epoch after which the message must not be selected.
    pub expire_epoch: Option<ChainEpoch>,
    /// Multiplier applied to the estimated gas limit, e.g. `1.25`.
    pub gas_over_estimation: f64,
    /// Multiplier applied to the estimated gas premium.
    pub gas_over_premium: f64,
    /// Ceiling on `gas_fee_cap * gas_limit`. Zero disables the cap.
    pub max_fee: TokenAmount,
}

impl Default for SendSpec {
    fn default() -> Self {
        SendSpec {
            expire_epoch: None,
            gas_over_estimation: 0.0,
            gas_over_premium: 0.0,
            max_fee: TokenAmount::zero(),
        }
    }
}

impl SendSpec {
    /// Field-wise merge, preferring set fields of `self` over `fallback`.
    pub fn or(&self, fallback: &SendSpec) -> SendSpec {
        SendSpec {
            expire_epoch: self.expire_epoch.or(fallback.expire_epoch),
            gas_over_estimation: if self.gas_over_estimation > 0.0 {
                self.gas_over_estimation
            } else {
                fallback.gas_over_estimation
            },
            gas_over_premium: if self.gas_over_premium > 0.0 {
                self.gas_over_premium
            } else {
                fallback.gas_over_premium
            },
            max_fee: if self.max_fee.is_zero() {
                fallback.max_fee.clone()
            } else {
                self.max_fee.clone()
            },
        }
    }
}

/// Execution receipt observed for an on-chain message.
///
/// This is a crate-local mirror of the chain receipt: `exit_code` is signed
/// so the revert sentinel is representable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageReceipt {
    pub exit_code: i64,
    pub return_data: RawBytes,
    pub gas_used: u64,
}

impl MessageReceipt {
    /// Sentinel exit code stored when an inclusion is rolled back by a reorg.
    pub const REVERTED_EXIT_CODE: i64 = -1;

    pub fn new(exit_code: i64, return_data: RawBytes, gas_used: u64) -> Self {
        MessageReceipt {
            exit_code,
            return_data,
            gas_used,
        }
    }

    /// The receipt a message carries while its previous inclusion is reverted.
    pub fn reverted() -> Self {
        MessageReceipt {
            exit_code: Self::REVERTED_EXIT_CODE,
            return_data: RawBytes::default(),
            gas_used: 0,
        }
    }

    pub fn is_reverted(&self) -> bool {
        self.exit_code == Self::REVERTED_EXIT_CODE
    }
}

/// A message under pool management.
///
/// `id` is the stable pool identity; `unsigned_cid`/`signed_cid` are the
/// chain-level content digests, set when the message is filled. The embedded
/// [`UnsignedMessage`] holds sender, receiver, nonce, value, method, params
/// and the gas fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub version: u64,
    pub message: UnsignedMessage,
    pub signature: Option<Signature>,
    pub unsigned_cid: Option<Cid>,
    pub signed_cid: Option<Cid>,
    pub height: ChainEpoch,
    pub receipt: Option<MessageReceipt>,
    pub tipset_key: Option<TipsetKey>,
    pub meta: SendSpec,
    pub wallet_name: String,
    pub state: MessageState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(message: UnsignedMessage, meta: SendSpec, wallet_name: String) -> Self {
        Self::with_id(Uuid::new_v4(), message, meta, wallet_name)
    }

    pub fn with_id(
        id: Uuid,
        message: UnsignedMessage,
        meta: SendSpec,
        wallet_name: String,
    ) -> Self {
        let now = Utc::now();
        Message {
            id,
            version: 0,
            message,
            signature: None,
            unsigned_cid: None,
            signed_cid: None,
            height: 0,
            receipt: None,
            tipset_key: None,
            meta,
            wallet_name,
            state: MessageState::UnFilled,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_addr(&self) -> fvm_shared::address::Address {
        self.message.from
    }

    pub fn nonce(&self) -> u64 {
        self.message.sequence
    }

    /// Content digest of the embedded unsigned message.
    pub fn unsigned_digest(&self) -> Result<Cid, Error> {
        Ok(cid_from_cbor(&self.message)?)
    }

    /// The signed form of this message, if it has been signed.
    pub fn signed_message(&self) -> Option<SignedMessage> {
        self.signature
            .clone()
            .map(|signature| SignedMessage::new_unchecked(self.message.clone(), signature))
    }

    /// Moves the message to `to`, enforcing the lifecycle state machine.
    /// An undeclared transition is a programming error and is rejected.
    pub fn transition(&mut self, to: MessageState) -> Result<(), Error> {
        if !self.state.can_transition(to) {
            return Err(Error::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fvm_shared::address::Address;

    fn unsigned(from: u64, to: u64) -> UnsignedMessage {
        UnsignedMessage {
            version: 0,
            from: Address::new_id(from),
            to: Address::new_id(to),
            sequence: 0,
            value: TokenAmount::zero(),
            method_num: 0,
            params: RawBytes::default(),
            gas_limit: 0,
            gas_fee_cap: TokenAmount::zero(),
            gas_premium: TokenAmount::zero(),
        }
    }

    #[test]
    fn state_machine_accepts_declared_transitions() {
        use MessageState::*;
        let allowed = [
            (UnFilled, Filled),
            (Filled, OnChain),
            (OnChain, Filled),
            (UnFilled, Expired),
            (Filled, Expired),
            (Filled, Failed),
            (Filled, Replaced),
            (OnChain, Replaced),
            (UnFilled, NoWallet),
            (Filled, NoWallet),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition(to), "{from} -> {to} must be allowed");
        }
    }

    #[test]
    fn state_machine_rejects_everything_else() {
        use MessageState::*;
        let all = [UnFilled, Filled, OnChain, Failed, Replaced, Expired, NoWallet];
        let allowed = [
            (UnFilled, Filled),
            (Filled, OnChain),
            (OnChain, Filled),
            (UnFilled, Expired),
            (Filled, Expired),
            (Filled, Failed),
            (Filled, Replaced),
            (OnChain, Replaced),
            (UnFilled, NoWallet),
            (Filled, NoWallet),
        ];
        for from in all {
            for to in all {
                let is_allowed = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    is_allowed,
                    "{from} -> {to} mismatch"
                );
            }
        }
    }

    #[test]
    fn transition_rejects_unfilled_to_on_chain() {
        let mut msg = Message::new(unsigned(1, 2), SendSpec::default(), "w1".into());
        let err = msg.transition(MessageState::OnChain).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(msg.state, MessageState::UnFilled);
    }

    #[test]
    fn send_spec_merge_prefers_set_fields() {
        let msg_spec = SendSpec {
            expire_epoch: Some(100),
            ..Default::default()
        };
        let addr_spec = SendSpec {
            gas_over_estimation: 1.5,
            max_fee: TokenAmount::from_atto(7u64),
            ..Default::default()
        };
        let shared = SendSpec {
            expire_epoch: Some(999),
            gas_over_estimation: 1.25,
            gas_over_premium: 1.1,
            max_fee: TokenAmount::from_atto(9u64),
        };
        let merged = msg_spec.or(&addr_spec).or(&shared);
        assert_eq!(merged.expire_epoch, Some(100));
        assert_eq!(merged.gas_over_estimation, 1.5);
        assert_eq!(merged.gas_over_premium, 1.1);
        assert_eq!(merged.max_fee, TokenAmount::from_atto(7u64));
    }

    #[test]
    fn reverted_receipt_sentinel() {
        let receipt = MessageReceipt::reverted();
        assert!(receipt.is_reverted());
        assert!(!MessageReceipt::new(0, RawBytes::default(), 42).is_reverted());
    }
}
