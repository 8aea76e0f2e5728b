// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::HashMap;
use cid::Cid;
use hashlink::LruCache;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::db::Repo;
use crate::errors::Error;
use crate::message::Message;

struct CacheEntry {
    msg: Message,
    expires_at: Instant,
}

struct Inner {
    entries: LruCache<Uuid, CacheEntry>,
    /// Chain events identify messages by signed-content digest, not by the
    /// pool id, hence the secondary index.
    by_signed_cid: HashMap<Cid, Uuid>,
}

/// Bounded, time-limited cache of message snapshots, backed by the
/// repository on miss. Entries are best-effort mirrors: a miss is always
/// resolvable through the repository, so staleness costs a lookup, never
/// data.
pub struct MessageStateCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    repo: Arc<dyn Repo>,
}

impl MessageStateCache {
    pub fn new(capacity: usize, ttl: Duration, repo: Arc<dyn Repo>) -> Self {
        MessageStateCache {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                by_signed_cid: HashMap::default(),
            }),
            ttl,
            repo,
        }
    }

    /// Looks a message up by pool id, falling back to the repository and
    /// repopulating the cache on a cold miss.
    pub fn get(&self, id: &Uuid) -> Result<Option<Message>, Error> {
        {
            let mut inner = self.inner.lock();
            match inner.entries.get(id) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Ok(Some(entry.msg.clone()));
                }
                Some(_) => {
                    inner.entries.remove(id);
                }
                None => {}
            }
        }
        match self.repo.get_message(id)? {
            Some(msg) => {
                self.set(msg.clone());
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    /// Looks a message up by signed-content digest.
    pub fn get_by_signed_cid(&self, cid: &Cid) -> Result<Option<Message>, Error> {
        let id = self.inner.lock().by_signed_cid.get(cid).copied();
        if let Some(id) = id
            && let Some(msg) = self.get(&id)?
            && msg.signed_cid.as_ref() == Some(cid)
        {
            return Ok(Some(msg));
        }
        match self.repo.get_message_by_signed_cid(cid)? {
            Some(msg) => {
                self.set(msg.clone());
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }

    pub fn set(&self, msg: Message) {
        let mut inner = self.inner.lock();
        if let Some(cid) = msg.signed_cid {
            inner.by_signed_cid.insert(cid, msg.id);
        }
        let expires_at = Instant::now() + self.ttl;
        inner.entries.insert(msg.id, CacheEntry { msg, expires_at });

        // The LRU evicts silently, so the index is pruned once it outgrows
        // the cache noticeably.
        if inner.by_signed_cid.len() > inner.entries.capacity() * 2 {
            let Inner {
                entries,
                by_signed_cid,
            } = &mut *inner;
            by_signed_cid.retain(|_, id| entries.contains_key(id));
        }
    }

    pub fn delete(&self, id: &Uuid) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.remove(id)
            && let Some(cid) = entry.msg.signed_cid
        {
            inner.by_signed_cid.remove(&cid);
        }
    }

    /// Applies a mutation to the cached snapshot identified by the signed
    /// digest, if it is resolvable. Returns whether a snapshot was updated.
    pub fn update_by_signed_cid(
        &self,
        cid: &Cid,
        f: impl FnOnce(&mut Message),
    ) -> Result<bool, Error> {
        match self.get_by_signed_cid(cid)? {
            Some(mut msg) => {
                f(&mut msg);
                self.set(msg);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
