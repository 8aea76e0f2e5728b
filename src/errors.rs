// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use fvm_shared::address::Address;
use thiserror::Error;
use uuid::Uuid;

use crate::message::MessageState;

/// Messager error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("message {0} not found")]
    MessageNotFound(Uuid),
    #[error("message with id {0} already exists")]
    DuplicateMessage(Uuid),
    #[error("address {0} is not managed by this pool")]
    AddressNotFound(Address),
    #[error("address {0} is not selectable")]
    AddressNotSelectable(Address),
    #[error("wallet {0} not found")]
    WalletNotFound(String),
    #[error("first head change notification must be a single current tipset")]
    BadHeadChange,
    #[error("block {block} has {messages} parent messages but {receipts} parent receipts")]
    MismatchedReceipts {
        block: Cid,
        messages: usize,
        receipts: usize,
    },
    #[error("tipset cache was built against network {cached}, chain reports {actual}")]
    NetworkNameMismatch { cached: String, actual: String },
    #[error("invalid message state transition {from} -> {to}")]
    InvalidStateTransition {
        from: MessageState,
        to: MessageState,
    },
    #[error("message {id} in state {state} cannot be replaced")]
    Unreplaceable { id: Uuid, state: MessageState },
    #[error("gas premium {premium} below replace-by-fee minimum {min}")]
    GasPremiumTooLow { premium: String, min: String },
    #[error("gas estimation failed: {0}")]
    GasEstimation(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("encoding error: {0}")]
    Encoding(#[from] fvm_ipld_encoding::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
