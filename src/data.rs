//! # Data
//!
//! Record payload handling. Payloads at or below [`MAX_ENCODED_SIZE`] are
//! embedded in the stored message (`encoded_data`); larger payloads are
//! chunked into content-addressed blocks with a root block linking the
//! chunks. The root block's CID is the payload's data CID.

use std::io::Read;
use std::str::FromStr;

use cid::Cid;
use ipld_core::ipld::Ipld;

use crate::provider::{BlockStore, DataStore};
use crate::store::block::{self, Block};
use crate::{Result, unexpected};

/// The maximum size (in bytes) of a payload stored inline in the message.
pub const MAX_ENCODED_SIZE: usize = 30000;

/// The size of a payload chunk block.
pub const CHUNK_SIZE: usize = 65536;

/// An in-memory payload stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataStream {
    buffer: Vec<u8>,
    offset: usize,
}

impl From<Vec<u8>> for DataStream {
    fn from(buffer: Vec<u8>) -> Self {
        Self { buffer, offset: 0 }
    }
}

impl Read for DataStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.buffer[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        Ok(n)
    }
}

impl DataStream {
    /// The stream's bytes, irrespective of the read position.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the stream, returning its bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Compute the data CID and size of the stream's contents.
    ///
    /// # Errors
    ///
    /// Fails when a chunk cannot be encoded.
    pub fn compute_cid(&self) -> Result<(String, usize)> {
        let (root_cid, size, _) = to_blocks(&self.buffer)?;
        Ok((root_cid, size))
    }

    /// Fetch a record's payload from the data store.
    ///
    /// # Errors
    ///
    /// Surfaces data store failures.
    pub async fn from_store(
        owner: &str, record_id: &str, data_cid: &str, store: &impl DataStore,
    ) -> Result<Option<Self>> {
        store
            .get(owner, record_id, data_cid)
            .await
            .map_err(|e| unexpected!("issue fetching data: {e}"))
    }
}

// Chunk payload bytes into dag-cbor blocks plus a root block linking them.
// Returns the root CID, the payload size, and every block (root last).
fn to_blocks(data: &[u8]) -> Result<(String, usize, Vec<(String, Vec<u8>)>)> {
    let mut links = Vec::new();
    let mut blocks = Vec::new();

    for chunk in data.chunks(CHUNK_SIZE) {
        let block = Block::encode(&Ipld::Bytes(chunk.to_vec()))?;
        let cid = Cid::from_str(block.cid()).map_err(|e| unexpected!("issue parsing CID: {e}"))?;
        links.push(Ipld::Link(cid));
        blocks.push((block.cid().to_string(), block.data().to_vec()));
    }

    let root = Block::encode(&Ipld::List(links))?;
    let root_cid = root.cid().to_string();
    blocks.push((root_cid.clone(), root.data().to_vec()));

    Ok((root_cid, data.len(), blocks))
}

/// Write a payload stream to the block store in chunks, returning the
/// computed root CID and payload size for the caller to verify against the
/// message descriptor.
///
/// # Errors
///
/// Surfaces block store failures.
pub async fn put(
    owner: &str, data: &DataStream, store: &impl BlockStore,
) -> Result<(String, usize)> {
    let (root_cid, size, blocks) = to_blocks(data.as_bytes())?;

    for (cid, bytes) in blocks {
        store
            .put(owner, &cid, &bytes)
            .await
            .map_err(|e| unexpected!("issue storing data: {e}"))?;
    }

    Ok((root_cid, size))
}

/// Read a payload from the block store by walking the root block's links.
///
/// # Errors
///
/// Surfaces block store failures and malformed block structures.
pub async fn get(
    owner: &str, data_cid: &str, store: &impl BlockStore,
) -> Result<Option<DataStream>> {
    let Some(bytes) = store.get(owner, data_cid).await? else {
        return Ok(None);
    };
    let Ipld::List(links) = block::decode(&bytes)? else {
        return Ok(None);
    };

    let mut buffer = Vec::new();
    for link in links {
        let Ipld::Link(link_cid) = link else {
            return Err(unexpected!("invalid data block link"));
        };
        let Some(bytes) = store.get(owner, &link_cid.to_string()).await? else {
            return Ok(None);
        };
        let Ipld::Bytes(chunk) = block::decode(&bytes)? else {
            return Err(unexpected!("invalid data block payload"));
        };
        buffer.extend_from_slice(&chunk);
    }

    Ok(Some(DataStream::from(buffer)))
}

/// Remove a payload's blocks from the block store.
///
/// # Errors
///
/// Surfaces block store failures.
pub async fn delete(owner: &str, data_cid: &str, store: &impl BlockStore) -> Result<()> {
    let Some(bytes) = store.get(owner, data_cid).await? else {
        return Ok(());
    };
    if let Ipld::List(links) = block::decode::<Ipld>(&bytes)? {
        for link in links {
            if let Ipld::Link(link_cid) = link {
                store.delete(owner, &link_cid.to_string()).await?;
            }
        }
    }
    store.delete(owner, data_cid).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_is_stable_across_chunking() {
        let data = vec![42u8; CHUNK_SIZE * 2 + 7];
        let stream = DataStream::from(data);

        let (cid_1, size_1) = stream.compute_cid().unwrap();
        let (cid_2, size_2) = stream.compute_cid().unwrap();
        assert_eq!(cid_1, cid_2);
        assert_eq!(size_1, size_2);
        assert_eq!(size_1, CHUNK_SIZE * 2 + 7);
    }

    #[test]
    fn distinct_payloads_have_distinct_cids() {
        let (cid_1, _) = DataStream::from(b"hello".to_vec()).compute_cid().unwrap();
        let (cid_2, _) = DataStream::from(b"hello!".to_vec()).compute_cid().unwrap();
        assert_ne!(cid_1, cid_2);
    }

    #[test]
    fn read_consumes_buffer() {
        let mut stream = DataStream::from(b"hello world".to_vec());
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello world");
    }
}
