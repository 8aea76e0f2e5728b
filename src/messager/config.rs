// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;
use std::time::Duration;

use fvm_shared::econ::TokenAmount;
use serde::{Deserialize, Serialize};

use crate::message::SendSpec;

/// Static configuration of the messager service, fixed at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagerConfig {
    /// Maximum number of addresses filled concurrently in one selection
    /// round. Gas estimation and signing are network round-trips, so this
    /// bounds in-flight RPCs, not CPU.
    pub sel_concurrency: usize,
    /// Delay between a head change settling and the selection trigger firing,
    /// so we do not select against a head that is about to be reverted.
    pub sel_trigger_delay_secs: u64,
    /// Fallback interval for selection rounds when no head change arrives.
    pub sel_interval_secs: u64,
    /// Interval of the removing-relation drain loop, which doubles as the
    /// back-off between safe-delete retries.
    pub drain_interval_secs: u64,
    /// Consecutive gas-estimation failures after which the rest of an
    /// address's round is abandoned.
    pub estimate_fail_limit: u32,
    /// Message state cache capacity and entry time-to-live.
    pub msg_cache_size: usize,
    pub msg_cache_ttl_secs: u64,
    /// Number of recent tipsets retained for reorg reconciliation, and where
    /// they are persisted across restarts.
    pub tipset_cache_capacity: usize,
    pub tipset_cache_path: PathBuf,
}

impl Default for MessagerConfig {
    fn default() -> Self {
        MessagerConfig {
            sel_concurrency: 10,
            sel_trigger_delay_secs: 8,
            sel_interval_secs: 30,
            drain_interval_secs: 30,
            estimate_fail_limit: 3,
            msg_cache_size: 4096,
            msg_cache_ttl_secs: 600,
            tipset_cache_capacity: 40,
            tipset_cache_path: PathBuf::from("tipset_cache.json"),
        }
    }
}

impl MessagerConfig {
    pub fn sel_trigger_delay(&self) -> Duration {
        Duration::from_secs(self.sel_trigger_delay_secs)
    }

    pub fn sel_interval(&self) -> Duration {
        Duration::from_secs(self.sel_interval_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn msg_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.msg_cache_ttl_secs)
    }
}

/// Runtime parameters shared by all addresses, adjustable without restart
/// through [`crate::messager::service::MessageService::set_shared_params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedParams {
    /// Default cap on unconfirmed messages per address, used when neither the
    /// address nor its wallet relation overrides it.
    pub sel_msg_num: u64,
    /// Global fee policy, the last layer of the merge.
    pub fee_spec: SendSpec,
    /// Interval between remote wallet polls.
    pub scan_interval_secs: u64,
}

impl Default for SharedParams {
    fn default() -> Self {
        SharedParams {
            sel_msg_num: 20,
            fee_spec: SendSpec {
                expire_epoch: None,
                gas_over_estimation: 1.25,
                gas_over_premium: 0.0,
                // 0.07 FIL, mirroring the default max fee of the reference
                // client.
                max_fee: TokenAmount::from_atto(70_000_000_000_000_000u64),
            },
            scan_interval_secs: 60,
        }
    }
}

impl SharedParams {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }
}
