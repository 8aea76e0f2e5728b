// Copyright 2019-2026 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

/// Computes the `dag-cbor` content digest of a serializable value.
///
/// The codec is [`fvm_ipld_encoding::DAG_CBOR`] and the hash function is
/// 256-bit BLAKE2b, matching the builder the reference Filecoin
/// implementations use for message identity.
pub fn cid_from_cbor<S: serde::Serialize>(obj: &S) -> Result<Cid, fvm_ipld_encoding::Error> {
    let bytes = fvm_ipld_encoding::to_vec(obj)?;
    Ok(Cid::new_v1(
        fvm_ipld_encoding::DAG_CBOR,
        Code::Blake2b256.digest(&bytes),
    ))
}
