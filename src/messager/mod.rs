// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! The message-pool coordination engine: head-change processing, message
//! state refresh, selection, caching and the wallet/address reconciler.

pub mod config;
pub mod head_change;
pub mod metrics;
pub mod msg_cache;
pub mod provider;
pub mod reconciler;
pub mod refresh;
pub mod selection;
pub mod service;
#[cfg(test)]
pub mod test_provider;
pub mod ts_cache;

pub use config::{MessagerConfig, SharedParams};
pub use selection::{MessageSelector, MsgSelectResult};
pub use service::MessageService;
