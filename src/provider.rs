//! # Provider
//!
//! Traits the host implements to supply storage, DID resolution, signing,
//! and event streaming. Provider methods return `anyhow::Result`: failures
//! surface to callers as internal errors.
//!
//! Every method is an async suspension point. The engine does not assume
//! cross-store atomicity; handlers order their side effects to be
//! crash-safe (data before message, message before event log, prune after
//! persist, emit last).

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::data::DataStream;
use crate::event::{Event, SubscribeFilter, Subscriber};
pub use crate::store::{Cursor, Entry, Query};
pub use crate::tasks::ResumableTask;

/// Web node provider: the set of backing services a node runs against.
pub trait Provider:
    MessageStore
    + DataStore
    + TaskStore
    + EventLog
    + EventStream
    + KeyStore
    + DidResolver
    + Clone
{
}

/// The `MessageStore` trait is used by implementers to provide message
/// storage capability.
///
/// Guarantees: strongly consistent within a single process — a `put`
/// followed by a `query` observes the write.
pub trait MessageStore: Send + Sync {
    /// Store a message (with its indexes) in the underlying store.
    fn put(&self, owner: &str, entry: &Entry) -> impl Future<Output = Result<()>> + Send;

    /// Query the underlying store for matches to the provided query.
    fn query(
        &self, owner: &str, query: &Query,
    ) -> impl Future<Output = Result<(Vec<Entry>, Option<Cursor>)>> + Send;

    /// Fetch a single message by CID, returning `None` if no message was
    /// found.
    fn get(
        &self, owner: &str, message_cid: &str,
    ) -> impl Future<Output = Result<Option<Entry>>> + Send;

    /// Delete the message associated with the specified CID.
    fn delete(&self, owner: &str, message_cid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Purge all messages from the store.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `DataStore` trait is used by implementers to provide content-addressed
/// storage for record payloads.
///
/// Objects are keyed by `(owner, data_cid)` and associated with one or more
/// records. The store reports the CID it computed for the stored bytes; the
/// caller compares it against the descriptor and unwinds with `delete` on a
/// mismatch.
pub trait DataStore: Send + Sync {
    /// Store payload bytes for the specified record, returning the computed
    /// CID and size of the stored data.
    fn put(
        &self, owner: &str, record_id: &str, data_cid: &str, data: DataStream,
    ) -> impl Future<Output = Result<(String, usize)>> + Send;

    /// Fetch payload bytes for the specified record, returning `None` when
    /// the record has no object with the given CID.
    fn get(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> impl Future<Output = Result<Option<DataStream>>> + Send;

    /// Bind an existing data object to a new record without re-uploading,
    /// returning the object's size, or `None` when no such object exists.
    fn associate(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> impl Future<Output = Result<Option<usize>>> + Send;

    /// Remove the record's reference to the data object. The object itself
    /// is removed once no record references it.
    fn delete(
        &self, owner: &str, record_id: &str, data_cid: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Purge all data from the store.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `BlockStore` trait provides low-level storage of content-addressed
/// blocks. Data stores typically chunk payloads into blocks (see
/// [`crate::data`]) over an implementation of this trait.
pub trait BlockStore: Send + Sync {
    /// Store a block in the underlying block store.
    fn put(&self, owner: &str, cid: &str, block: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Fetch a single block by CID, returning `None` when no match was
    /// found.
    fn get(&self, owner: &str, cid: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Delete the block associated with the specified CID.
    fn delete(&self, owner: &str, cid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Purge all blocks from the store.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `TaskStore` trait is used by implementers to provide durable storage
/// for resumable tasks.
pub trait TaskStore: Send + Sync {
    /// Registers a new resumable task that is currently in-flight/under
    /// processing to the store.
    ///
    /// If the task times out, a client will be able to grab it through the
    /// `grab()` method and resume the task.
    fn register(
        &self, owner: &str, task: &ResumableTask, timeout_secs: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Grabs `count` unhandled tasks from the store.
    ///
    /// Unhandled tasks are tasks that are not currently in-flight/under
    /// processing (ie. tasks that have timed-out).
    ///
    /// N.B.: The implementation must make sure that once a task is grabbed
    /// by a client, its timeout must be updated so that it is considered
    /// in-flight/under processing and cannot be grabbed by another client
    /// until it is timed-out.
    fn grab(
        &self, owner: &str, count: u64,
    ) -> impl Future<Output = Result<Vec<ResumableTask>>> + Send;

    /// Reads the task associated with the task ID provided regardless of
    /// whether it is in-flight/under processing or not.
    fn read(
        &self, owner: &str, task_id: &str,
    ) -> impl Future<Output = Result<Option<ResumableTask>>> + Send;

    /// Extends the timeout of the task associated with the task ID provided.
    ///
    /// No-op if the task is not found, as this implies that the task has
    /// already been completed. This allows the client executing the task to
    /// continue working on it before it is considered timed out.
    fn extend(
        &self, owner: &str, task_id: &str, timeout_secs: u64,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the task associated with the specified ID.
    fn delete(&self, owner: &str, task_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Purge all tasks from the store.
    fn purge(&self, owner: &str) -> impl Future<Output = Result<()>> + Send;
}

/// The `EventLog` trait provides an append-only, per-tenant log of messages
/// with strictly monotonic watermark cursors.
pub trait EventLog: Send + Sync {
    /// Adds a message event to a owner's event log.
    fn append(&self, owner: &str, event: &Event) -> impl Future<Output = Result<()>> + Send;

    /// Retrieves all of a owner's events that occurred after the cursor
    /// provided. If no cursor is provided, all events for the owner are
    /// returned.
    fn events(
        &self, owner: &str, cursor: Option<Cursor>,
    ) -> impl Future<Output = Result<(Vec<Event>, Option<Cursor>)>> + Send;

    /// Retrieves a filtered set of events that occurred after the cursor
    /// provided, accepting multiple filters. If no cursor is provided, all
    /// events for the owner and filter combination are returned.
    fn query(
        &self, owner: &str, query: &Query,
    ) -> impl Future<Output = Result<(Vec<Event>, Option<Cursor>)>> + Send;

    /// Deletes the event for the specified `message_cid`.
    fn delete(&self, owner: &str, message_cid: &str) -> impl Future<Output = Result<()>> + Send;

    /// Purge all events from the log.
    fn purge(&self) -> impl Future<Output = Result<()>> + Send;
}

/// The `EventStream` trait provides in-memory, best-effort fan-out of
/// record events to live subscribers. Events for a tenant are delivered in
/// emit order.
pub trait EventStream: Send + Sync {
    /// Subscribes to an owner's event stream.
    fn subscribe(
        &self, owner: &str, filter: SubscribeFilter,
    ) -> impl Future<Output = Result<Subscriber>> + Send;

    /// Emits an event to an owner's event stream.
    fn emit(&self, owner: &str, event: &Event) -> impl Future<Output = Result<()>> + Send;
}

/// The `DidResolver` trait is used to proxy the resolution of a DID to a
/// DID document. Implementers can either resolve offline-resolvable methods
/// (such as `did:key`) directly or delegate to a universal resolver.
pub trait DidResolver: Send + Sync {
    /// Resolve the DID URL to a DID document.
    fn resolve(&self, url: &str) -> impl Future<Output = Result<Document>> + Send;
}

/// A DID document, reduced to the verification material the engine needs.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// The DID the document describes.
    pub id: String,

    /// Verification methods (public keys) for the DID.
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
}

/// A single verification method within a DID document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    /// The verification method identifier (referenced by JWS `kid`).
    pub id: String,

    /// The controller of the verification method.
    pub controller: String,

    /// The verification method type.
    #[serde(rename = "type")]
    pub method_type: String,

    /// The public key, multibase-encoded with a multicodec prefix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_multibase: Option<String>,
}

/// The `KeyStore` trait provides access to signing keys by controller DID.
pub trait KeyStore: Send + Sync {
    /// Returns a keyring for the specified controller.
    ///
    /// # Errors
    ///
    /// Returns an error when no keyring exists for the controller.
    fn keyring(&self, controller: &str) -> Result<impl Keyring>;
}

/// The `Keyring` trait provides the signing capability for a single
/// controller.
pub trait Keyring: Signer + Send + Sync {}

/// The `Signer` trait provides digital signing for message authorization.
pub trait Signer: Send + Sync {
    /// Sign the provided message bytes.
    fn try_sign(&self, msg: &[u8]) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// The verifying key corresponding to the signing key.
    fn public_key(&self) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// The signing algorithm.
    fn algorithm(&self) -> Algorithm;

    /// The verification method (`kid`) to include in signatures.
    fn verification_method(&self) -> String;
}

/// Supported signing algorithms.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum Algorithm {
    /// Edwards-curve digital signature (Ed25519).
    #[default]
    #[serde(rename = "EdDSA")]
    EdDsa,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EdDsa => write!(f, "EdDSA"),
        }
    }
}
