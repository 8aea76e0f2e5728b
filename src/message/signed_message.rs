// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use fvm_shared::crypto::signature::{Signature, SignatureType};

use crate::message::UnsignedMessage;
use crate::utils::cid_from_cbor;

/// A message together with the signature obtained from the owning wallet.
/// This is the form broadcast to the network.
#[derive(PartialEq, Clone, Debug, Serialize_tuple, Deserialize_tuple)]
pub struct SignedMessage {
    pub message: UnsignedMessage,
    pub signature: Signature,
}

impl SignedMessage {
    /// Pairs a message with a signature without verifying it. Signatures are
    /// produced by the remote wallet and validated by the chain.
    pub fn new_unchecked(message: UnsignedMessage, signature: Signature) -> SignedMessage {
        SignedMessage { message, signature }
    }

    pub fn message(&self) -> &UnsignedMessage {
        &self.message
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_bls(&self) -> bool {
        self.signature.signature_type() == SignatureType::BLS
    }

    /// The chain-level content digest of the signed message.
    ///
    /// BLS messages are identified by the digest of the bare message, since
    /// their signatures are aggregated out of the block; everything else
    /// hashes the signed envelope.
    pub fn cid(&self) -> Result<Cid, fvm_ipld_encoding::Error> {
        if self.is_bls() {
            cid_from_cbor(&self.message)
        } else {
            cid_from_cbor(self)
        }
    }
}
