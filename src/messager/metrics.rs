// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::LazyLock;

use parking_lot::{RwLock, RwLockWriteGuard};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

static DEFAULT_REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(Default::default);

pub fn default_registry<'a>() -> RwLockWriteGuard<'a, Registry> {
    DEFAULT_REGISTRY.write()
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct AddressLabel {
    pub address: String,
}

pub static MESSAGES_SELECTED: LazyLock<Counter> = LazyLock::new(|| {
    let metric = Counter::default();
    DEFAULT_REGISTRY.write().register(
        "messager_messages_selected",
        "Messages filled and signed by the selector",
        metric.clone(),
    );
    metric
});

pub static MESSAGES_EXPIRED: LazyLock<Counter> = LazyLock::new(|| {
    let metric = Counter::default();
    DEFAULT_REGISTRY.write().register(
        "messager_messages_expired",
        "Messages excluded from selection because their expiry epoch passed",
        metric.clone(),
    );
    metric
});

pub static GAS_ESTIMATE_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
    let metric = Counter::default();
    DEFAULT_REGISTRY.write().register(
        "messager_gas_estimate_failures",
        "Failed gas estimation calls during selection",
        metric.clone(),
    );
    metric
});

pub static ADDRESS_NONCE_GAP: LazyLock<Family<AddressLabel, Gauge>> = LazyLock::new(|| {
    let metric = Family::default();
    DEFAULT_REGISTRY.write().register(
        "messager_address_nonce_gap",
        "Unconfirmed nonce backlog per managed address",
        metric.clone(),
    );
    metric
});
