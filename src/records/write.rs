//! # Records Write
//!
//! The records write endpoint handles `RecordsWrite` messages — requests
//! to create or update a record. The pipeline authenticates the
//! signer(s), authorizes the action, arbitrates against existing versions
//! (newest writer wins), verifies payload integrity, persists, prunes
//! superseded versions, and notifies subscribers.

use std::collections::BTreeMap;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::SecondsFormat::Micros;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::authorization::{Authorization, JwsPayload};
use crate::data::{DataStream, MAX_ENCODED_SIZE};
use crate::endpoint::{Message, Reply, Status};
use crate::jws::{Jws, JwsBuilder};
use crate::permissions::{self, Grant};
use crate::provider::{DataStore, EventLog, EventStream, MessageStore, Provider, Signer};
use crate::records::{self, protocol};
use crate::store::{Entry, EntryType, GrantedQuery};
use crate::{
    Descriptor, Error, Interface, Method, Result, forbidden, invalid, protocols, unexpected, utils,
};

/// Handle — or process — a [`Write`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authentication or
/// authorization fails, when the message fails an integrity check, or when
/// an issue occurs persisting the message.
pub async fn handle(
    owner: &str, mut write: Write, provider: &impl Provider,
) -> Result<Reply<WriteReply>> {
    // authenticate
    write
        .authorization
        .verify(provider)
        .await
        .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;

    // structural and referential integrity
    write.verify_integrity(owner, provider).await?;

    // authorize
    write.authorize(owner, provider).await?;

    // fetch existing versions of the record
    let existing = records::existing_entries(owner, &write.record_id, provider).await?;
    let (initial, newest_existing) = earliest_and_latest(&existing);

    if let Some(initial) = &initial {
        write.verify_immutable(initial)?;
    } else if !write.is_initial()? {
        return Err(invalid!("initial write not found"));
    }

    // newest-wins arbitration: incoming wins iff no existing version is
    // newer, ordered by (message_timestamp, message CID)
    if let Some(newest) = &newest_existing {
        let incoming = (write.descriptor.base.message_timestamp, write.cid()?);
        let current = (newest.descriptor().message_timestamp, newest.cid()?);

        if incoming == current {
            // an exact duplicate of the latest state is a no-op, unless the
            // stored message is awaiting data and the stream has now arrived
            let awaiting_data = newest.indexes.get("archived") == Some(&true.into())
                && write.data_stream.is_some();
            if !awaiting_data {
                return Ok(Reply {
                    status: Status {
                        code: StatusCode::ACCEPTED.as_u16(),
                        detail: None,
                    },
                    body: None,
                });
            }
        }
        if incoming < current {
            if incoming.0 == current.0 {
                return Err(Error::Conflict(
                    "an update with a larger CID already exists".to_string(),
                ));
            }
            return Err(Error::Conflict("a more recent update exists".to_string()));
        }
    }

    // payload handling: the write is queryable only once it carries data
    let latest_base = write.process_data(owner, &existing, provider).await?;

    // persist
    let mut entry = Entry::from(&write);
    if !latest_base {
        entry.add_index("archived", true);
    }
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry).await?;

    // prune superseded versions, retaining the initial write
    delete_earlier(owner, &write, &existing, provider).await?;

    // a permission revocation cascades to grant-authorized messages
    if write.descriptor.protocol.as_deref() == Some(protocols::PROTOCOL_URI)
        && write.descriptor.protocol_path.as_deref() == Some(protocols::REVOCATION_PATH)
    {
        revocation_cascade(owner, &write, provider).await?;
    }

    if latest_base {
        EventStream::emit(provider, owner, &entry).await?;
    }

    debug!(record_id = %write.record_id, "records write accepted");

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Write`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Write {
    /// The record's ID: the entry ID of the record's initial write.
    pub record_id: String,

    /// The record's context: the path of record IDs from the root record
    /// to this record. Set for protocol-bound records only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The Write descriptor.
    pub descriptor: WriteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,

    /// A JWS attesting to the descriptor, signed by a party other than
    /// the author.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation: Option<Jws>,

    /// The record's payload, base64url-encoded. Set when the payload is
    /// at or below the inline-encoding threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoded_data: Option<String>,

    /// The payload stream accompanying the message. Not part of the
    /// message itself.
    #[serde(skip)]
    pub(crate) data_stream: Option<DataStream>,
}

impl Message for Write {
    type Reply = WriteReply;

    fn cid(&self) -> Result<String> {
        // `encoded_data` and the data stream are not part of the message's
        // identity
        let mut message = self.clone();
        message.encoded_data = None;
        message.data_stream = None;
        utils::cid::from_value(&message)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

/// [`WriteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct WriteReply;

/// The [`Write`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The record's recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,

    /// The protocol the record is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// The record's path within the protocol structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// The record's schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Tags associated with the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,

    /// The ID of the record's structural parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// The CID of the record's payload.
    pub data_cid: String,

    /// The size of the record's payload, in bytes.
    pub data_size: usize,

    /// The datetime the record was created.
    #[serde(with = "utils::rfc3339_micros")]
    pub date_created: DateTime<Utc>,

    /// Whether the record is published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// The datetime the record was published.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "utils::rfc3339_micros_opt")]
    #[serde(default)]
    pub date_published: Option<DateTime<Utc>>,

    /// The MIME type of the record's payload.
    pub data_format: String,
}

/// The payload of a `RecordsWrite` message signature.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignaturePayload {
    /// The base signature payload.
    #[serde(flatten)]
    pub base: JwsPayload,

    /// The ID of the record the message pertains to.
    pub record_id: String,

    /// The record's context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The CID of the message's attestation, when one is present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_cid: Option<String>,
}

/// A bounded, by-value copy of the grant `RecordsWrite` invoked in a
/// delegation. Stored by value to avoid owning-pointer cycles between
/// messages; resolved against the store by ID during validation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DelegatedGrant {
    /// The grant record's ID.
    pub record_id: String,

    /// The grant record's context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// The grant record's descriptor.
    pub descriptor: WriteDescriptor,

    /// The grant record's authorization.
    pub authorization: Box<Authorization>,

    /// The grant's payload, base64url-encoded.
    pub encoded_data: String,
}

impl DelegatedGrant {
    /// Unpack the delegated grant into a [`Grant`].
    ///
    /// # Errors
    ///
    /// Fails when the grant payload cannot be decoded.
    pub fn to_grant(&self) -> Result<Grant> {
        Grant::try_from(self)
    }

    /// Compute the CID of the delegated grant message.
    ///
    /// # Errors
    ///
    /// Fails when the grant cannot be serialized to CBOR.
    pub fn cid(&self) -> Result<String> {
        let mut grant = self.clone();
        grant.encoded_data = String::new();
        utils::cid::from_value(&grant)
    }
}

impl TryFrom<Write> for DelegatedGrant {
    type Error = crate::Error;

    fn try_from(write: Write) -> Result<Self> {
        let Some(encoded_data) = write.encoded_data else {
            return Err(unexpected!("grant write has no encoded data"));
        };
        Ok(Self {
            record_id: write.record_id,
            context_id: write.context_id,
            descriptor: write.descriptor,
            authorization: Box::new(write.authorization),
            encoded_data,
        })
    }
}

/// Compute a record entry ID: the CID of the descriptor plus the logical
/// author. The entry ID of a record's initial write is its `record_id`.
///
/// # Errors
///
/// Fails when the descriptor cannot be serialized.
pub fn entry_id(descriptor: &WriteDescriptor, author: &str) -> Result<String> {
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct EntryId<'a> {
        #[serde(flatten)]
        descriptor: &'a WriteDescriptor,
        author: &'a str,
    }
    utils::cid::from_value(&EntryId { descriptor, author })
}

impl Write {
    /// Attach the payload stream to submit alongside the message.
    #[must_use]
    pub fn with_data(mut self, data: DataStream) -> Self {
        self.data_stream = Some(data);
        self
    }

    /// Whether this message is the record's initial write.
    ///
    /// # Errors
    ///
    /// Fails when the entry ID cannot be computed.
    pub fn is_initial(&self) -> Result<bool> {
        let author = self.authorization.author()?;
        Ok(entry_id(&self.descriptor, &author)? == self.record_id)
    }

    /// The signature payload of the message.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be deserialized.
    pub fn signature_payload(&self) -> Result<SignaturePayload> {
        self.authorization.signature.payload()
    }

    /// Add an owner signature to the message, attesting that the tenant
    /// retains this externally authored message.
    ///
    /// # Errors
    ///
    /// Fails when signing fails.
    pub async fn sign_as_owner(&mut self, signer: &impl Signer) -> Result<()> {
        let payload = JwsPayload {
            descriptor_cid: utils::cid::from_value(&self.descriptor)?,
            ..JwsPayload::default()
        };
        self.authorization.owner_signature = Some(JwsBuilder::new(payload).build(signer).await?);
        Ok(())
    }

    /// Add an owner signature on behalf of the tenant, citing the
    /// delegated grant that authorizes the signer to act as the tenant.
    ///
    /// # Errors
    ///
    /// Fails when signing fails.
    pub async fn sign_as_delegate(
        &mut self, delegated_grant: DelegatedGrant, signer: &impl Signer,
    ) -> Result<()> {
        let payload = JwsPayload {
            descriptor_cid: utils::cid::from_value(&self.descriptor)?,
            delegated_grant_id: Some(delegated_grant.cid()?),
            ..JwsPayload::default()
        };
        self.authorization.owner_signature = Some(JwsBuilder::new(payload).build(signer).await?);
        self.authorization.owner_delegated_grant = Some(delegated_grant);
        Ok(())
    }

    /// Build flattened indexes for the write message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> BTreeMap<String, Value> {
        let descriptor = &self.descriptor;
        let mut indexes = BTreeMap::new();

        indexes.insert("interface".to_string(), Value::String(Interface::Records.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Write.to_string()));
        indexes.insert("recordId".to_string(), Value::String(self.record_id.clone()));
        let timestamp = descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true);
        indexes.insert("messageTimestamp".to_string(), Value::String(timestamp.clone()));
        indexes.insert("dateUpdated".to_string(), Value::String(timestamp));
        indexes.insert(
            "dateCreated".to_string(),
            Value::String(descriptor.date_created.to_rfc3339_opts(Micros, true)),
        );
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert("dataCid".to_string(), Value::String(descriptor.data_cid.clone()));
        indexes.insert("dataSize".to_string(), Value::from(descriptor.data_size));
        indexes.insert("dataFormat".to_string(), Value::String(descriptor.data_format.clone()));
        indexes.insert(
            "published".to_string(),
            Value::Bool(descriptor.published.unwrap_or_default()),
        );
        indexes.insert("archived".to_string(), Value::Bool(false));

        if let Some(recipient) = &descriptor.recipient {
            indexes.insert("recipient".to_string(), Value::String(recipient.clone()));
        }
        if let Some(protocol) = &descriptor.protocol {
            indexes.insert("protocol".to_string(), Value::String(protocol.clone()));
        }
        if let Some(protocol_path) = &descriptor.protocol_path {
            indexes.insert("protocolPath".to_string(), Value::String(protocol_path.clone()));
        }
        if let Some(schema) = &descriptor.schema {
            indexes.insert("schema".to_string(), Value::String(schema.clone()));
        }
        if let Some(parent_id) = &descriptor.parent_id {
            indexes.insert("parentId".to_string(), Value::String(parent_id.clone()));
        }
        if let Some(context_id) = &self.context_id {
            indexes.insert("contextId".to_string(), Value::String(context_id.clone()));
        }
        if let Some(date_published) = &descriptor.date_published {
            indexes.insert(
                "datePublished".to_string(),
                Value::String(date_published.to_rfc3339_opts(Micros, true)),
            );
        }
        if let Some(attestation) = &self.attestation {
            indexes.insert(
                "attester".to_string(),
                Value::String(attestation.did().unwrap_or_default()),
            );
        }
        if let Ok(payload) = self.signature_payload() {
            if let Some(grant_id) = payload.base.permission_grant_id {
                indexes.insert("permissionGrantId".to_string(), Value::String(grant_id));
            }
        }
        if let Some(tags) = &descriptor.tags {
            for (tag, value) in tags {
                indexes.insert(format!("tag.{tag}"), value.clone());
            }
        }

        indexes
    }

    // Verify the message's structural and referential integrity.
    async fn verify_integrity(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let payload = self.signature_payload()?;

        // the signature must cover this descriptor and record
        if payload.base.descriptor_cid != utils::cid::from_value(&self.descriptor)? {
            return Err(invalid!("signature payload does not match message descriptor"));
        }
        if payload.record_id != self.record_id {
            return Err(invalid!("signature payload does not match record ID"));
        }
        if payload.context_id != self.context_id {
            return Err(invalid!("signature payload does not match context ID"));
        }

        if self.is_initial()? {
            // an initial write's timestamp is its creation time
            if self.descriptor.base.message_timestamp != self.descriptor.date_created {
                return Err(invalid!(
                    "initial write message timestamp must match date created"
                ));
            }
        }

        // publication consistency
        if self.descriptor.published.unwrap_or_default()
            && self.descriptor.date_published.is_none()
        {
            return Err(invalid!("published records must set a publish date"));
        }
        if !self.descriptor.published.unwrap_or_default()
            && self.descriptor.date_published.is_some()
        {
            return Err(invalid!("unpublished records must not set a publish date"));
        }

        if self.descriptor.protocol.is_some() {
            protocol::verify_integrity(owner, self, provider).await?;
        } else {
            // structural parentage is a protocol concept
            if self.descriptor.protocol_path.is_some()
                || self.descriptor.parent_id.is_some()
                || self.context_id.is_some()
            {
                return Err(invalid!("protocol path requires a protocol"));
            }
        }

        Ok(())
    }

    // Verify immutable properties are bit-identical to the initial write.
    fn verify_immutable(&self, initial: &Write) -> Result<()> {
        let descriptor = &self.descriptor;
        let immutable = [
            ("dateCreated", descriptor.date_created != initial.descriptor.date_created),
            ("schema", descriptor.schema != initial.descriptor.schema),
            ("protocol", descriptor.protocol != initial.descriptor.protocol),
            ("protocolPath", descriptor.protocol_path != initial.descriptor.protocol_path),
            ("parentId", descriptor.parent_id != initial.descriptor.parent_id),
            ("contextId", self.context_id != initial.context_id),
            ("recipient", descriptor.recipient != initial.descriptor.recipient),
        ];
        for (property, changed) in immutable {
            if changed {
                return Err(invalid!("immutable property `{property}` has changed"));
            }
        }
        Ok(())
    }

    // Authorize the message, applying the first matching rule: tenant
    // retention (owner signature), tenant authorship, permission grant,
    // protocol rules. Anything else is denied.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;

        // the tenant retaining an externally authored message
        if let Some(owner_did) = authzn.owner()? {
            if owner_did != owner {
                return Err(forbidden!("owner signature does not match web node owner"));
            }
            if let Some(delegated) = &authzn.owner_delegated_grant {
                let grant = delegated.to_grant()?;
                grant.verify_delegated(&owner_did, &authzn.owner_signer()?)?;
                grant.verify(owner, &self.descriptor.base, provider).await?;
                grant.verify_records_scope(self)?;
            }
            return Ok(());
        }

        let author = authzn.author()?;

        // an author delegate acts within the delegated grant's scope; the
        // grant names the signer as grantee and the author as grantor
        if let Some(delegated) = &authzn.author_delegated_grant {
            let grant = delegated.to_grant()?;
            grant.verify_delegated(&author, &authzn.signer()?)?;
            grant.permit_write(owner, &authzn.signer()?, self, provider).await?;
        }

        if author == owner {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            if grant.grantor != owner {
                return Err(forbidden!("grant not granted by web node owner"));
            }
            return grant.permit_write(owner, &author, self, provider).await;
        }

        if self.descriptor.protocol.is_some() {
            return protocol::permit_write(owner, self, provider).await;
        }

        Err(forbidden!("message failed authorization"))
    }

    // Handle the message's payload, returning whether the write holds data
    // and thereby becomes the latest base state.
    async fn process_data(
        &mut self, owner: &str, existing: &[Entry], provider: &impl Provider,
    ) -> Result<bool> {
        if let Some(stream) = self.data_stream.clone() {
            if self.descriptor.data_size <= MAX_ENCODED_SIZE {
                // buffer, verify, and embed small payloads
                let (data_cid, data_size) = stream.compute_cid()?;
                if data_cid != self.descriptor.data_cid {
                    return Err(invalid!("actual data CID does not match message `data_cid`"));
                }
                if data_size != self.descriptor.data_size {
                    return Err(invalid!("actual data size does not match message `data_size`"));
                }
                self.encoded_data = Some(Base64UrlUnpadded::encode_string(stream.as_bytes()));
            } else {
                // store large payloads out-of-band, verifying the CID the
                // store computed and unwinding on mismatch
                let (data_cid, data_size) = DataStore::put(
                    provider,
                    owner,
                    &self.record_id,
                    &self.descriptor.data_cid,
                    stream,
                )
                .await?;
                if data_cid != self.descriptor.data_cid {
                    DataStore::delete(provider, owner, &self.record_id, &data_cid).await?;
                    return Err(invalid!("actual data CID does not match message `data_cid`"));
                }
                if data_size != self.descriptor.data_size {
                    DataStore::delete(provider, owner, &self.record_id, &data_cid).await?;
                    return Err(invalid!("actual data size does not match message `data_size`"));
                }
            }
            return Ok(true);
        }

        // no data stream: an initial write is stored awaiting data (not
        // queryable); a subsequent write inherits the newest existing data
        let Some(newest) = existing.last() else {
            return Ok(false);
        };
        if newest.descriptor().method == Method::Delete {
            return Err(invalid!("missing data stream"));
        }
        let newest_write = match &newest.message {
            EntryType::Write(write) => write,
            _ => return Err(unexpected!("expected `RecordsWrite` message")),
        };

        if self.descriptor.data_cid != newest_write.descriptor.data_cid {
            return Err(invalid!("data CID does not match newest existing version"));
        }
        if self.descriptor.data_size != newest_write.descriptor.data_size {
            return Err(invalid!("data size does not match newest existing version"));
        }

        if self.descriptor.data_size <= MAX_ENCODED_SIZE {
            let Some(encoded) = &newest_write.encoded_data else {
                return Err(invalid!("missing data stream"));
            };
            self.encoded_data = Some(encoded.clone());
        } else {
            let Some(data_size) =
                DataStore::associate(provider, owner, &self.record_id, &self.descriptor.data_cid)
                    .await?
            else {
                return Err(invalid!("referenced data does not exist"));
            };
            if data_size != self.descriptor.data_size {
                return Err(invalid!("referenced data size does not match message `data_size`"));
            }
        }

        Ok(true)
    }
}

// Find the initial write and the newest entry among the record's stored
// messages (sorted oldest first).
fn earliest_and_latest(entries: &[Entry]) -> (Option<Write>, Option<Entry>) {
    let initial = entries.iter().find_map(|entry| {
        entry
            .as_write()
            .filter(|write| write.is_initial().unwrap_or_default())
            .cloned()
    });
    (initial, entries.last().cloned())
}

// Delete every message for the record older than the incoming write,
// except the initial write, which is retained in an archived state. Data
// no longer referenced by a retained version is removed.
async fn delete_earlier(
    owner: &str, write: &Write, existing: &[Entry], provider: &impl Provider,
) -> Result<()> {
    for entry in existing {
        if entry.descriptor().message_timestamp >= write.descriptor.base.message_timestamp {
            continue;
        }

        // a superseded tombstone (record resurrection) is removed outright
        let Some(existing_write) = entry.as_write() else {
            let cid = entry.cid()?;
            MessageStore::delete(provider, owner, &cid).await?;
            EventLog::delete(provider, owner, &cid).await?;
            continue;
        };

        // release data unless the incoming write references the same object
        if existing_write.descriptor.data_cid != write.descriptor.data_cid
            && existing_write.descriptor.data_size > MAX_ENCODED_SIZE
        {
            DataStore::delete(
                provider,
                owner,
                &existing_write.record_id,
                &existing_write.descriptor.data_cid,
            )
            .await?;
        }

        if existing_write.is_initial()? {
            // retain the initial write, flagged out of the queryable state
            let mut archived = Entry::from(existing_write);
            archived.add_index("archived", true);
            MessageStore::put(provider, owner, &archived).await?;
        } else {
            let cid = entry.cid()?;
            MessageStore::delete(provider, owner, &cid).await?;
            EventLog::delete(provider, owner, &cid).await?;
        }
    }

    Ok(())
}

// Best-effort deletion of messages authorized by a grant that has just
// been revoked: every message citing the grant with a timestamp at or
// after the revocation is removed.
async fn revocation_cascade(owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
    let Some(grant_id) = &write.descriptor.parent_id else {
        return Err(invalid!("revocation has no parent grant"));
    };

    let query = GrantedQuery {
        permission_grant_id: grant_id.clone(),
        from: write.descriptor.base.message_timestamp,
    };
    let (entries, _) = MessageStore::query(provider, owner, &query.into()).await?;

    for entry in entries {
        let cid = entry.cid()?;
        if let Some(revoked) = entry.as_write() {
            DataStore::delete(provider, owner, &revoked.record_id, &revoked.descriptor.data_cid)
                .await?;
        }
        MessageStore::delete(provider, owner, &cid).await?;
        EventLog::delete(provider, owner, &cid).await?;
    }

    Ok(())
}

/// Record data passed to the [`WriteBuilder`].
#[derive(Clone, Debug)]
pub enum Data {
    /// A payload stream to write with the message.
    Stream(DataStream),

    /// A reference to already-stored data.
    Cid {
        /// The CID of the existing payload.
        data_cid: String,

        /// The size of the existing payload, in bytes.
        data_size: usize,
    },
}

impl Default for Data {
    fn default() -> Self {
        Self::Stream(DataStream::default())
    }
}

impl From<Vec<u8>> for Data {
    fn from(data: Vec<u8>) -> Self {
        Self::Stream(DataStream::from(data))
    }
}

/// A protocol and protocol path pair for the [`WriteBuilder`].
#[derive(Clone, Debug, Default)]
pub struct WriteProtocol {
    /// The protocol URI.
    pub protocol: String,

    /// The record's path within the protocol structure.
    pub protocol_path: String,
}

/// Builds a [`Write`] message.
#[derive(Clone, Debug, Default)]
pub struct WriteBuilder {
    recipient: Option<String>,
    protocol: Option<WriteProtocol>,
    schema: Option<String>,
    tags: Option<Map<String, Value>>,
    parent_context_id: Option<String>,
    data: Data,
    data_format: Option<String>,
    date_created: Option<DateTime<Utc>>,
    message_timestamp: Option<DateTime<Utc>>,
    published: Option<bool>,
    date_published: Option<DateTime<Utc>>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    existing: Option<Write>,
}

impl WriteBuilder {
    /// Returns a new [`WriteBuilder`] for a record's initial write.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [`WriteBuilder`] for a subsequent version of the record,
    /// carrying over its immutable properties.
    #[must_use]
    pub fn from(existing: Write) -> Self {
        Self {
            data: Data::Cid {
                data_cid: existing.descriptor.data_cid.clone(),
                data_size: existing.descriptor.data_size,
            },
            existing: Some(existing),
            ..Self::default()
        }
    }

    /// The record's recipient.
    #[must_use]
    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    /// Bind the record to a protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: WriteProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// The record's schema.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a tag to the record.
    #[must_use]
    pub fn add_tag(mut self, tag: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.get_or_insert_with(Map::new).insert(tag.into(), value.into());
        self
    }

    /// The context of the record's structural parent. The parent's ID is
    /// the final segment of the context.
    #[must_use]
    pub fn parent_context_id(mut self, parent_context_id: impl Into<String>) -> Self {
        self.parent_context_id = Some(parent_context_id.into());
        self
    }

    /// The record's payload.
    #[must_use]
    pub fn data(mut self, data: Data) -> Self {
        self.data = data;
        self
    }

    /// The MIME type of the record's payload. Defaults to
    /// `application/json`.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// The datetime the record was created. Defaults to now.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateTime<Utc>) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// The message's timestamp. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Whether the record is published.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// The datetime the record was published. Defaults to the message
    /// timestamp when the record is published.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateTime<Utc>) -> Self {
        self.date_published = Some(date_published);
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical
    /// author, who is the grantor of the delegated grant.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// The ID of the permission grant invoked to authorize the message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// The protocol role invoked to authorize the message.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Generate and sign the Write message.
    ///
    /// # Errors
    ///
    /// Fails when properties are inconsistent or signing fails.
    #[allow(clippy::too_many_lines)]
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let message_timestamp = self.message_timestamp.unwrap_or_else(Utc::now);

        let (data_cid, data_size, data_stream) = match &self.data {
            Data::Stream(stream) => {
                let (data_cid, data_size) = stream.compute_cid()?;
                (data_cid, data_size, Some(stream.clone()))
            }
            Data::Cid {
                data_cid,
                data_size,
            } => (data_cid.clone(), *data_size, None),
        };

        let mut descriptor = if let Some(existing) = &self.existing {
            // subsequent version: immutable properties carry over
            let mut descriptor = existing.descriptor.clone();
            descriptor.base.message_timestamp = message_timestamp;
            descriptor.data_cid = data_cid;
            descriptor.data_size = data_size;
            if let Some(tags) = self.tags {
                descriptor.tags = Some(tags);
            }
            descriptor
        } else {
            let date_created = self.date_created.unwrap_or(message_timestamp);
            let (protocol, protocol_path) = match &self.protocol {
                Some(write_protocol) => (
                    Some(utils::clean_url(&write_protocol.protocol)?),
                    Some(write_protocol.protocol_path.clone()),
                ),
                None => (None, None),
            };
            let schema = self.schema.map(|s| utils::clean_url(&s)).transpose()?;
            let parent_id = self
                .parent_context_id
                .as_ref()
                .and_then(|context| context.rsplit('/').next().map(String::from));

            WriteDescriptor {
                base: Descriptor {
                    interface: Interface::Records,
                    method: Method::Write,
                    message_timestamp,
                },
                recipient: self.recipient,
                protocol,
                protocol_path,
                schema,
                tags: self.tags,
                parent_id,
                data_cid,
                data_size,
                date_created,
                published: None,
                date_published: None,
                data_format: self.data_format.unwrap_or_else(|| "application/json".to_string()),
            }
        };

        // publication state may change between versions
        if let Some(published) = self.published {
            descriptor.published = Some(published);
        }
        if descriptor.published.unwrap_or_default() {
            if let Some(date_published) = self.date_published {
                descriptor.date_published = Some(date_published);
            } else if descriptor.date_published.is_none() {
                descriptor.date_published = Some(message_timestamp);
            }
        } else {
            descriptor.date_published = None;
        }

        // the logical author anchors the record's identity
        let author = if let Some(delegated) = &self.delegated_grant {
            delegated.authorization.signature.did()?
        } else {
            let kid = signer.verification_method();
            let Some((did, _)) = kid.split_once('#') else {
                return Err(unexpected!("no DID found in kid"));
            };
            did.to_string()
        };

        let (record_id, context_id) = if let Some(existing) = &self.existing {
            (existing.record_id.clone(), existing.context_id.clone())
        } else {
            let record_id = entry_id(&descriptor, &author)?;
            let context_id = if descriptor.protocol.is_some() {
                match &self.parent_context_id {
                    Some(parent_context) => Some(format!("{parent_context}/{record_id}")),
                    None => Some(record_id.clone()),
                }
            } else {
                None
            };
            (record_id, context_id)
        };

        let payload = SignaturePayload {
            base: JwsPayload {
                descriptor_cid: utils::cid::from_value(&descriptor)?,
                permission_grant_id: self.permission_grant_id,
                delegated_grant_id: self
                    .delegated_grant
                    .as_ref()
                    .map(DelegatedGrant::cid)
                    .transpose()?,
                protocol_role: self.protocol_role,
            },
            record_id: record_id.clone(),
            context_id: context_id.clone(),
            attestation_cid: None,
        };
        let signature = JwsBuilder::new(payload).build(signer).await?;

        // embed small payloads so the message is self-contained
        let encoded_data = match (&data_stream, data_size <= MAX_ENCODED_SIZE) {
            (Some(stream), true) => Some(Base64UrlUnpadded::encode_string(stream.as_bytes())),
            _ => None,
        };

        Ok(Write {
            record_id,
            context_id,
            descriptor,
            authorization: Authorization {
                signature,
                owner_signature: None,
                author_delegated_grant: self.delegated_grant,
                owner_delegated_grant: None,
            },
            attestation: None,
            encoded_data,
            data_stream,
        })
    }
}
