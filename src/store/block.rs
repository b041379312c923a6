//! # Block
//!
//! Content-addressed block encoding. Blocks are canonical dag-cbor with a
//! v1 CID (SHA2-256 multihash). Any alternate codec or hash on an inbound
//! CID is rejected by comparison against the recomputed value.

use multihash_codetable::{Code, MultihashDigest};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Result, unexpected};

/// The dag-cbor multicodec code.
const DAG_CBOR: u64 = 0x71;

/// An encoded block and its content identifier.
pub struct Block {
    data: Vec<u8>,
    cid: String,
}

impl Block {
    /// Encode the payload to a dag-cbor block.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be serialized.
    pub fn encode<T: Serialize>(payload: &T) -> Result<Self> {
        let data = serde_ipld_dagcbor::to_vec(payload)
            .map_err(|e| unexpected!("issue encoding block: {e}"))?;
        let hash = Code::Sha2_256.digest(&data);
        let cid = cid::Cid::new_v1(DAG_CBOR, hash).to_string();

        Ok(Self { data, cid })
    }

    /// The block's content identifier.
    #[must_use]
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// The block's encoded bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Decode a dag-cbor block.
///
/// # Errors
///
/// Fails when the bytes are not valid dag-cbor for `T`.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_ipld_dagcbor::from_slice(data).map_err(|e| unexpected!("issue decoding block: {e}"))
}
