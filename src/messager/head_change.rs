// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Single consumer of chain head-change notifications. All batches run
//! through one sequential loop, so reorg reconciliation never races with
//! itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blocks::{Tipset, TipsetKey};
use crate::errors::Error;
use crate::messager::provider::{HeadChange, Provider};
use crate::messager::refresh::MessageStateRefresher;
use crate::messager::ts_cache::TipsetCache;

pub struct HeadChangeProcessor {
    provider: Arc<dyn Provider>,
    ts_cache: Arc<TipsetCache>,
    refresher: Arc<MessageStateRefresher>,
}

impl HeadChangeProcessor {
    pub fn new(
        provider: Arc<dyn Provider>,
        ts_cache: Arc<TipsetCache>,
        refresher: Arc<MessageStateRefresher>,
    ) -> Self {
        HeadChangeProcessor {
            provider,
            ts_cache,
            refresher,
        }
    }

    /// Consumes head-change batches until cancellation or the subscription
    /// closes. The first event must be a single `Current` snapshot; anything
    /// else aborts startup. Refresh errors on later batches are transient:
    /// the transaction rolled back and the next batch retries.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) -> anyhow::Result<()> {
        let rx = self.provider.subscribe_head_changes();
        let first = tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            batch = rx.recv_async() => match batch {
                Ok(batch) => batch,
                Err(_) => return Ok(()),
            },
        };
        let head = match first.as_slice() {
            [HeadChange::Current(ts)] => ts.clone(),
            _ => {
                error!("malformed first head change notification, aborting");
                return Err(Error::BadHeadChange.into());
            }
        };
        self.reconnect_check(head).await?;

        loop {
            let batch = tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                batch = rx.recv_async() => match batch {
                    Ok(batch) => batch,
                    Err(_) => return Ok(()),
                },
            };
            let mut revert = Vec::new();
            let mut apply = Vec::new();
            for change in batch {
                match change {
                    HeadChange::Apply(ts) => apply.push(ts),
                    HeadChange::Revert(ts) => revert.push(ts),
                    HeadChange::Current(ts) => {
                        warn!(
                            epoch = ts.epoch(),
                            "unexpected current notification mid-stream, treating as apply"
                        );
                        apply.push(ts);
                    }
                }
            }
            if let Err(e) = self.refresher.refresh(&revert, &apply, false).await {
                error!("failed to refresh message state on head change: {e}");
            }
        }
    }

    /// Walks from the persisted head to the live head along parent links,
    /// synthesizing the revert/apply batches missed while the service was
    /// down.
    async fn reconnect_check(&self, head: Arc<Tipset>) -> Result<(), Error> {
        let actual = self.provider.state_network_name().await?;
        let cached = self.ts_cache.network_name();
        if cached != actual {
            // load-time mismatches discard the cache; seeing one here means
            // the node switched networks under us
            return Err(Error::NetworkNameMismatch { cached, actual });
        }
        let Some(local_head) = self.ts_cache.head() else {
            self.ts_cache.add(&head);
            if let Err(e) = self.ts_cache.save() {
                warn!("failed to persist tipset cache: {e}");
            }
            return Ok(());
        };
        if local_head.key() == head.key() {
            return Ok(());
        }
        info!(
            cached = %local_head.key(),
            chain = %head.key(),
            "cached head diverged from chain head, reconciling"
        );

        let mut revert = Vec::new();
        let mut apply = Vec::new();
        let mut local_ts = Arc::new(local_head);
        let mut chain_ts = head.clone();
        while local_ts.key() != chain_ts.key() {
            if local_ts.epoch() > chain_ts.epoch() {
                revert.push(local_ts.clone());
                local_ts = match self.load_local(local_ts.parents()).await {
                    Ok(ts) => ts,
                    Err(e) => {
                        warn!("cannot resolve cached chain history ({e}), discarding tipset cache");
                        self.ts_cache.reset(&head);
                        if let Err(e) = self.ts_cache.save() {
                            warn!("failed to persist tipset cache: {e}");
                        }
                        return Ok(());
                    }
                };
            } else {
                apply.push(chain_ts.clone());
                chain_ts = self.provider.load_tipset(chain_ts.parents()).await?;
            }
        }
        // oldest first, the order the chain applied them
        apply.reverse();
        self.refresher.refresh(&revert, &apply, true).await
    }

    async fn load_local(&self, key: &TipsetKey) -> Result<Arc<Tipset>, Error> {
        if let Some(ts) = self.ts_cache.find(key) {
            return Ok(Arc::new(ts));
        }
        self.provider.load_tipset(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AddressRepo, MemRepo, MessageRepo};
    use crate::message::{MessageReceipt, MessageState};
    use crate::messager::msg_cache::MessageStateCache;
    use crate::messager::refresh::SelectionTrigger;
    use crate::messager::test_provider::{TestApi, mock_chain, mock_message, mock_tipset};
    use crate::wallet::AddressEntry;
    use fvm_ipld_encoding::RawBytes;
    use fvm_shared::address::Address;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Harness {
        repo: Arc<MemRepo>,
        api: Arc<TestApi>,
        ts_cache: Arc<TipsetCache>,
        processor: Arc<HeadChangeProcessor>,
    }

    fn harness() -> Harness {
        let repo = Arc::new(MemRepo::new());
        let api = Arc::new(TestApi::default());
        let msg_cache = Arc::new(MessageStateCache::new(
            64,
            Duration::from_secs(60),
            repo.clone(),
        ));
        let ts_cache = Arc::new(TipsetCache::new(
            16,
            PathBuf::from("unused.json"),
            "testnet".into(),
        ));
        let (trigger, _trigger_rx) = SelectionTrigger::new();
        let refresher = Arc::new(MessageStateRefresher::new(
            repo.clone(),
            api.clone(),
            msg_cache,
            ts_cache.clone(),
            trigger,
            Duration::from_millis(10),
        ));
        let processor = Arc::new(HeadChangeProcessor::new(
            api.clone(),
            ts_cache.clone(),
            refresher,
        ));
        Harness {
            repo,
            api,
            ts_cache,
            processor,
        }
    }

    #[tokio::test]
    async fn malformed_first_event_aborts_startup() {
        let h = harness();
        let ts = mock_tipset(None, 1);
        h.api
            .publish_head_changes(vec![HeadChange::Apply(ts.clone()), HeadChange::Apply(ts)]);
        let err = h
            .processor
            .clone()
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("current tipset"));
    }

    #[tokio::test]
    async fn empty_cache_is_seeded_from_current_head() {
        let h = harness();
        let chain = mock_chain(&h.api, 3);
        let head = chain.last().unwrap().clone();
        h.processor.reconnect_check(head.clone()).await.unwrap();
        assert_eq!(h.ts_cache.head().unwrap().key(), head.key());
    }

    #[tokio::test]
    async fn network_switch_is_a_protocol_violation() {
        let repo = Arc::new(MemRepo::new());
        let api = Arc::new(TestApi::new("mainnet"));
        let msg_cache = Arc::new(MessageStateCache::new(
            64,
            Duration::from_secs(60),
            repo.clone(),
        ));
        // Cache built against a different network than the node reports.
        let ts_cache = Arc::new(TipsetCache::new(
            16,
            PathBuf::from("unused.json"),
            "calibnet".into(),
        ));
        let (trigger, _rx) = SelectionTrigger::new();
        let refresher = Arc::new(MessageStateRefresher::new(
            repo,
            api.clone(),
            msg_cache,
            ts_cache.clone(),
            trigger,
            Duration::from_millis(10),
        ));
        let processor = Arc::new(HeadChangeProcessor::new(api.clone(), ts_cache, refresher));

        let chain = mock_chain(&api, 1);
        let err = processor
            .reconnect_check(chain[0].clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NetworkNameMismatch { .. }));
    }

    #[tokio::test]
    async fn reconnect_applies_missed_tipsets() {
        let h = harness();
        let addr = Address::new_id(1);
        h.repo.save_address(&AddressEntry::new(addr, 0)).unwrap();

        // The pool saw the chain up to epoch 1; the node is now at epoch 3.
        let chain = mock_chain(&h.api, 4);
        h.ts_cache.add(&chain[0]);
        h.ts_cache.add(&chain[1]);

        // A filled message landed at epoch 3 while we were down.
        let mut msg = mock_message(addr, 0);
        msg.unsigned_cid = Some(msg.unsigned_digest().unwrap());
        msg.transition(MessageState::Filled).unwrap();
        h.repo.create_message(&msg).unwrap();
        h.api.set_parent_messages(
            chain[3].block_cids()[0],
            vec![(
                msg.message.clone(),
                MessageReceipt::new(0, RawBytes::default(), 5),
            )],
        );

        h.processor
            .reconnect_check(chain[3].clone())
            .await
            .unwrap();

        let updated = h.repo.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(updated.state, MessageState::OnChain);
        assert_eq!(updated.height, chain[3].epoch());
        assert_eq!(h.ts_cache.head().unwrap().key(), chain[3].key());
    }

    #[tokio::test]
    async fn reconnect_reverts_stale_fork() {
        let h = harness();
        let addr = Address::new_id(1);
        h.repo.save_address(&AddressEntry::new(addr, 0)).unwrap();

        let chain = mock_chain(&h.api, 3);
        // Cached head sits on a fork block at epoch 2 that the chain dropped.
        let fork = mock_tipset(Some(&chain[1]), 99);
        h.api.register_tipset(fork.clone());
        h.ts_cache.add(&chain[0]);
        h.ts_cache.add(&chain[1]);
        h.ts_cache.add(&fork);

        // A message confirmed on the fork must revert to Filled.
        let mut msg = mock_message(addr, 0);
        msg.unsigned_cid = Some(msg.unsigned_digest().unwrap());
        msg.transition(MessageState::Filled).unwrap();
        msg.transition(MessageState::OnChain).unwrap();
        msg.height = fork.epoch();
        msg.receipt = Some(MessageReceipt::new(0, RawBytes::default(), 5));
        h.repo.create_message(&msg).unwrap();

        h.processor
            .reconnect_check(chain[2].clone())
            .await
            .unwrap();

        let updated = h.repo.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(updated.state, MessageState::Filled);
        assert!(updated.receipt.unwrap().is_reverted());
        assert_eq!(h.ts_cache.head().unwrap().key(), chain[2].key());
    }

    #[tokio::test]
    async fn matching_heads_are_a_no_op() {
        let h = harness();
        let chain = mock_chain(&h.api, 2);
        h.ts_cache.add(&chain[0]);
        h.ts_cache.add(&chain[1]);
        h.processor
            .reconnect_check(chain[1].clone())
            .await
            .unwrap();
        assert_eq!(h.ts_cache.head().unwrap().key(), chain[1].key());
    }
}
