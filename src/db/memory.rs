// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use ahash::HashMap;
use cid::Cid;
use fvm_shared::address::Address;
use fvm_shared::clock::ChainEpoch;
use itertools::Itertools;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::db::{AddressRepo, MessageRepo, Repo, WalletAddressRepo, WalletRepo};
use crate::errors::Error;
use crate::message::{Message, MessageState};
use crate::wallet::{AddressEntry, AddressState, Wallet, WalletAddress};

#[derive(Default, Clone)]
struct MemState {
    messages: HashMap<Uuid, Message>,
    addresses: HashMap<Address, AddressEntry>,
    wallets: HashMap<Uuid, Wallet>,
    wallet_addresses: HashMap<Uuid, WalletAddress>,
}

/// In-memory repository backend. Transactions run against a snapshot of the
/// whole store and replace it on success, so a failing closure leaves the
/// store untouched. Writes racing a transaction are last-writer-wins; the
/// engine serializes its own write paths, so this only matters to tests.
#[derive(Default)]
pub struct MemRepo {
    state: Mutex<MemState>,
    txn_lock: Mutex<()>,
}

impl MemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state(state: MemState) -> Self {
        MemRepo {
            state: Mutex::new(state),
            txn_lock: Mutex::new(()),
        }
    }
}

impl MessageRepo for MemRepo {
    fn create_message(&self, msg: &Message) -> Result<(), Error> {
        let mut state = self.state.lock();
        if state.messages.contains_key(&msg.id) {
            return Err(Error::DuplicateMessage(msg.id));
        }
        state.messages.insert(msg.id, msg.clone());
        Ok(())
    }

    fn save_message(&self, msg: &Message) -> Result<(), Error> {
        self.state.lock().messages.insert(msg.id, msg.clone());
        Ok(())
    }

    fn get_message(&self, id: &Uuid) -> Result<Option<Message>, Error> {
        Ok(self.state.lock().messages.get(id).cloned())
    }

    fn get_message_by_signed_cid(&self, cid: &Cid) -> Result<Option<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .find(|m| m.signed_cid.as_ref() == Some(cid))
            .cloned())
    }

    fn get_message_by_from_and_nonce(
        &self,
        from: &Address,
        nonce: u64,
    ) -> Result<Option<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| {
                matches!(m.state, MessageState::Filled | MessageState::OnChain)
                    && m.from_addr() == *from
                    && m.nonce() == nonce
            })
            .max_by_key(|m| m.updated_at)
            .cloned())
    }

    fn list_messages_by_address(&self, addr: &Address) -> Result<Vec<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.from_addr() == *addr)
            .cloned()
            .sorted_by_key(|m| (m.created_at, m.id))
            .collect())
    }

    fn list_messages_by_state(&self, state: MessageState) -> Result<Vec<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.state == state)
            .cloned()
            .sorted_by_key(|m| (m.created_at, m.id))
            .collect())
    }

    fn list_unfilled_messages(&self, addr: &Address) -> Result<Vec<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.state == MessageState::UnFilled && m.from_addr() == *addr)
            .cloned()
            .sorted_by_key(|m| (m.created_at, m.id))
            .collect())
    }

    fn list_filled_messages(&self, addr: &Address) -> Result<Vec<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.state == MessageState::Filled && m.from_addr() == *addr)
            .cloned()
            .sorted_by_key(|m| m.nonce())
            .collect())
    }

    fn list_on_chain_messages_by_height(
        &self,
        height: ChainEpoch,
    ) -> Result<Vec<Message>, Error> {
        Ok(self
            .state
            .lock()
            .messages
            .values()
            .filter(|m| m.state == MessageState::OnChain && m.height == height)
            .cloned()
            .sorted_by_key(|m| (m.from_addr().to_string(), m.nonce()))
            .collect())
    }
}

impl AddressRepo for MemRepo {
    fn save_address(&self, entry: &AddressEntry) -> Result<(), Error> {
        self.state.lock().addresses.insert(entry.addr, entry.clone());
        Ok(())
    }

    fn get_address(&self, addr: &Address) -> Result<Option<AddressEntry>, Error> {
        Ok(self.state.lock().addresses.get(addr).cloned())
    }

    fn list_addresses(&self) -> Result<Vec<AddressEntry>, Error> {
        Ok(self
            .state
            .lock()
            .addresses
            .values()
            .filter(|a| !a.is_deleted)
            .cloned()
            .sorted_by_key(|a| (a.weight, a.created_at, a.id))
            .collect())
    }

    fn list_addresses_by_state(&self, state: AddressState) -> Result<Vec<AddressEntry>, Error> {
        Ok(self
            .state
            .lock()
            .addresses
            .values()
            .filter(|a| !a.is_deleted && a.state == state)
            .cloned()
            .sorted_by_key(|a| (a.weight, a.created_at, a.id))
            .collect())
    }
}

impl WalletRepo for MemRepo {
    fn save_wallet(&self, wallet: &Wallet) -> Result<(), Error> {
        self.state.lock().wallets.insert(wallet.id, wallet.clone());
        Ok(())
    }

    fn get_wallet(&self, id: &Uuid) -> Result<Option<Wallet>, Error> {
        Ok(self.state.lock().wallets.get(id).cloned())
    }

    fn get_wallet_by_name(&self, name: &str) -> Result<Option<Wallet>, Error> {
        Ok(self
            .state
            .lock()
            .wallets
            .values()
            .find(|w| !w.is_deleted && w.name == name)
            .cloned())
    }

    fn list_wallets(&self) -> Result<Vec<Wallet>, Error> {
        Ok(self
            .state
            .lock()
            .wallets
            .values()
            .filter(|w| !w.is_deleted)
            .cloned()
            .sorted_by_key(|w| (w.created_at, w.id))
            .collect())
    }
}

impl WalletAddressRepo for MemRepo {
    fn save_wallet_address(&self, relation: &WalletAddress) -> Result<(), Error> {
        self.state
            .lock()
            .wallet_addresses
            .insert(relation.id, relation.clone());
        Ok(())
    }

    fn get_wallet_address(
        &self,
        wallet_id: &Uuid,
        addr: &Address,
    ) -> Result<Option<WalletAddress>, Error> {
        Ok(self
            .state
            .lock()
            .wallet_addresses
            .values()
            .find(|wa| !wa.is_deleted && wa.wallet_id == *wallet_id && wa.addr == *addr)
            .cloned())
    }

    fn list_wallet_addresses_by_wallet(
        &self,
        wallet_id: &Uuid,
    ) -> Result<Vec<WalletAddress>, Error> {
        Ok(self
            .state
            .lock()
            .wallet_addresses
            .values()
            .filter(|wa| !wa.is_deleted && wa.wallet_id == *wallet_id)
            .cloned()
            .sorted_by_key(|wa| (wa.created_at, wa.id))
            .collect())
    }

    fn list_wallet_addresses_by_addr(&self, addr: &Address) -> Result<Vec<WalletAddress>, Error> {
        Ok(self
            .state
            .lock()
            .wallet_addresses
            .values()
            .filter(|wa| !wa.is_deleted && wa.addr == *addr)
            .cloned()
            .sorted_by_key(|wa| (wa.created_at, wa.id))
            .collect())
    }

    fn list_wallet_addresses_by_state(
        &self,
        state: AddressState,
    ) -> Result<Vec<WalletAddress>, Error> {
        Ok(self
            .state
            .lock()
            .wallet_addresses
            .values()
            .filter(|wa| !wa.is_deleted && wa.addr_state == state)
            .cloned()
            .sorted_by_key(|wa| (wa.created_at, wa.id))
            .collect())
    }
}

impl Repo for MemRepo {
    fn transaction(
        &self,
        f: &mut dyn FnMut(&dyn Repo) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let _guard = self.txn_lock.lock();
        let snapshot = self.state.lock().clone();
        let tx = MemRepo::with_state(snapshot);
        f(&tx)?;
        *self.state.lock() = tx.state.into_inner();
        Ok(())
    }
}
