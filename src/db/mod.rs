// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Persistence boundary. The coordination engine only depends on these
//! traits; a backend is selected at service construction. The in-memory
//! backend in [`memory`] backs tests and development deployments.

mod memory;

pub use memory::MemRepo;

use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use uuid::Uuid;

use crate::errors::Error;
use crate::message::{Message, MessageState};
use crate::wallet::{AddressEntry, AddressState, Wallet, WalletAddress};

/// Message collection. Nonce-keyed lookups only consider messages whose
/// nonce has been assigned (`Filled` or `OnChain`); `UnFilled` rows do not
/// own a nonce yet.
pub trait MessageRepo: Send + Sync {
    fn create_message(&self, msg: &Message) -> Result<(), Error>;
    fn save_message(&self, msg: &Message) -> Result<(), Error>;
    fn get_message(&self, id: &Uuid) -> Result<Option<Message>, Error>;
    fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Option<Message>, Error>;
    fn get_message_by_from_and_nonce(
        &self,
        from: &Address,
        nonce: u64,
    ) -> Result<Option<Message>, Error>;
    fn list_messages_by_address(&self, addr: &Address) -> Result<Vec<Message>, Error>;
    fn list_messages_by_state(&self, state: MessageState) -> Result<Vec<Message>, Error>;
    /// Not-yet-signed messages for an address, oldest first.
    fn list_unfilled_messages(&self, addr: &Address) -> Result<Vec<Message>, Error>;
    /// Signed-but-unconfirmed messages for an address, by ascending nonce.
    fn list_filled_messages(&self, addr: &Address) -> Result<Vec<Message>, Error>;
    /// Confirmed messages included at the given height.
    fn list_on_chain_messages_by_height(&self, height: ChainEpoch)
    -> Result<Vec<Message>, Error>;
}

/// Address ledger collection. Listings exclude soft-deleted rows.
pub trait AddressRepo: Send + Sync {
    fn save_address(&self, entry: &AddressEntry) -> Result<(), Error>;
    fn get_address(&self, addr: &Address) -> Result<Option<AddressEntry>, Error>;
    fn list_addresses(&self) -> Result<Vec<AddressEntry>, Error>;
    fn list_addresses_by_state(&self, state: AddressState) -> Result<Vec<AddressEntry>, Error>;
}

/// Wallet collection. Listings exclude soft-deleted rows.
pub trait WalletRepo: Send + Sync {
    fn save_wallet(&self, wallet: &Wallet) -> Result<(), Error>;
    fn get_wallet(&self, id: &Uuid) -> Result<Option<Wallet>, Error>;
    fn get_wallet_by_name(&self, name: &str) -> Result<Option<Wallet>, Error>;
    fn list_wallets(&self) -> Result<Vec<Wallet>, Error>;
}

/// Wallet-address relation collection. Listings exclude soft-deleted rows
/// unless stated otherwise.
pub trait WalletAddressRepo: Send + Sync {
    fn save_wallet_address(&self, relation: &WalletAddress) -> Result<(), Error>;
    fn get_wallet_address(
        &self,
        wallet_id: &Uuid,
        addr: &Address,
    ) -> Result<Option<WalletAddress>, Error>;
    fn list_wallet_addresses_by_wallet(
        &self,
        wallet_id: &Uuid,
    ) -> Result<Vec<WalletAddress>, Error>;
    fn list_wallet_addresses_by_addr(&self, addr: &Address) -> Result<Vec<WalletAddress>, Error>;
    fn list_wallet_addresses_by_state(
        &self,
        state: AddressState,
    ) -> Result<Vec<WalletAddress>, Error>;
}

/// The full repository: every collection plus an all-or-nothing transaction
/// primitive. The closure receives transactional handles to the same
/// collections; an `Err` return rolls the whole batch back.
pub trait Repo: MessageRepo + AddressRepo + WalletRepo + WalletAddressRepo {
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Repo) -> Result<(), Error>,
    ) -> Result<(), Error>;
}
