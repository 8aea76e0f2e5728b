// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Message pool manager service for Filecoin-compatible chains.
//!
//! This crate accepts pending messages from producers, assigns nonces,
//! estimates gas, obtains signatures from remote wallets, and tracks each
//! message through inclusion, reorg-driven reversion, replacement and expiry.
//! It decouples message producers from the chain's mempool while guaranteeing
//! at most one pending message per nonce per address.
//!
//! The coordination engine lives in [`messager`]; the chain node, remote
//! wallets, persistence and gossip transport are reached through the trait
//! boundaries in [`messager::provider`], [`wallet`] and [`db`].

pub mod blocks;
pub mod db;
pub mod errors;
pub mod message;
pub mod messager;
pub mod utils;
pub mod wallet;

pub use errors::Error;
pub use messager::service::MessageService;
