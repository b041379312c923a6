//! # Records Delete
//!
//! The records delete endpoint handles `RecordsDelete` messages — requests
//! to delete a record. The record is not erased outright: a [`Delete`]
//! tombstone supersedes it, prior versions are pruned (retaining the
//! initial [`Write`] unless `prune` is set), and with `prune` set every
//! descendant record is removed. The deletion runs as a resumable task so
//! a crash mid-prune is retried at startup.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_recursion::async_recursion;
use chrono::SecondsFormat::Micros;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{DataStore, EventLog, EventStream, MessageStore, Provider, Signer};
use crate::records::{self, DelegatedGrant, RecordsFilter, Write, protocol};
use crate::store::{Entry, RecordsQueryBuilder};
use crate::tasks::{self, Task, TaskType};
use crate::{
    Descriptor, Error, Interface, Method, Result, forbidden, permissions, unexpected, utils,
};

/// Handle — or process — a [`Delete`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs deleting the specified record.
pub async fn handle(
    owner: &str, delete: Delete, provider: &impl Provider,
) -> Result<Reply<DeleteReply>> {
    delete
        .authorization
        .verify(provider)
        .await
        .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;

    // deletion requires an existing record
    let entries = records::existing_entries(owner, &delete.descriptor.record_id, provider).await?;
    let Some(latest) = entries.last() else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };

    // check the latest existing message has not already been deleted
    if latest.descriptor().method == Method::Delete {
        // cannot delete a `RecordsDelete` record
        if !delete.descriptor.prune {
            return Err(Error::NotFound("cannot delete a `RecordsDelete` record".to_string()));
        }

        // cannot prune a previously pruned record
        let existing_delete = Delete::try_from(latest)?;
        if existing_delete.descriptor.prune {
            return Err(Error::NotFound(
                "attempting to prune an already pruned record".to_string(),
            ));
        }
    }

    let Some(initial) = find_initial(&entries)? else {
        return Err(unexpected!("initial write not found"));
    };

    delete.authorize(owner, &initial, provider).await?;

    // the delete must strictly post-date the latest existing version
    if delete.descriptor.base.message_timestamp <= latest.descriptor().message_timestamp {
        return Err(Error::Conflict("newer record version exists".to_string()));
    }

    // run the deletion as a resumable task
    tasks::run(owner, TaskType::RecordsDelete(delete.clone()), provider).await?;

    debug!(record_id = %delete.descriptor.record_id, "records delete accepted");

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: None,
    })
}

/// The [`Delete`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Delete {
    /// The Delete descriptor.
    pub descriptor: DeleteDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Delete {
    type Reply = DeleteReply;

    fn cid(&self) -> Result<String> {
        utils::cid::from_value(self)
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

/// [`DeleteReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeleteReply;

/// The [`Delete`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The ID of the record to delete.
    pub record_id: String,

    /// Whether descendant records should be pruned as well.
    #[serde(default)]
    pub prune: bool,
}

impl Task for Delete {
    async fn run(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        delete(owner, self, provider).await
    }
}

impl Delete {
    /// Build flattened indexes for the delete message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> BTreeMap<String, Value> {
        let mut indexes = BTreeMap::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Records.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Delete.to_string()));
        indexes.insert("recordId".to_string(), Value::String(self.descriptor.record_id.clone()));
        let timestamp = self.descriptor.base.message_timestamp.to_rfc3339_opts(Micros, true);
        indexes.insert("messageTimestamp".to_string(), Value::String(timestamp.clone()));
        indexes.insert("dateUpdated".to_string(), Value::String(timestamp));
        indexes.insert(
            "author".to_string(),
            Value::String(self.authorization.author().unwrap_or_default()),
        );
        indexes.insert("archived".to_string(), Value::Bool(false));
        indexes
    }

    // Authorize the delete message against the record's initial write.
    async fn authorize(
        &self, owner: &str, initial: &Write, provider: &impl Provider,
    ) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // when signed by a delegate, authorize the delegate: the grant
        // names the signer as grantee and the author as grantor
        if let Some(delegated) = &authzn.author_delegated_grant {
            let grant = delegated.to_grant()?;
            grant.verify_delegated(&author, &authzn.signer()?)?;
            grant.permit_delete(owner, &authzn.signer()?, self, initial, provider).await?;
        }

        if author == owner {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            if grant.grantor != owner {
                return Err(forbidden!("grant not granted by web node owner"));
            }
            return grant.permit_delete(owner, &author, self, initial, provider).await;
        }

        if initial.descriptor.protocol.is_some() {
            return protocol::permit_delete(owner, self, initial, provider).await;
        }

        Err(forbidden!("delete request failed authorization"))
    }
}

// Find the record's initial write among its stored entries.
fn find_initial(entries: &[Entry]) -> Result<Option<Write>> {
    for entry in entries {
        if let Some(write) = entry.as_write() {
            if write.is_initial()? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}

// Perform the deletion: persist the tombstone, prune prior versions, and
// (when requested) purge every descendant record. Idempotent: a re-run
// after a crash repeats the same steps to the same end state.
async fn delete(owner: &str, delete: &Delete, provider: &impl Provider) -> Result<()> {
    let entries = records::existing_entries(owner, &delete.descriptor.record_id, provider).await?;
    let Some(latest) = entries.last() else {
        return Err(Error::NotFound("no matching record found".to_string()));
    };
    if delete.descriptor.base.message_timestamp < latest.descriptor().message_timestamp {
        return Err(Error::Conflict("newer record version exists".to_string()));
    }
    let Some(initial) = find_initial(&entries)? else {
        return Err(unexpected!("initial write not found"));
    };

    // the tombstone carries the record's indexes so it remains filterable
    let mut tombstone = Entry::from(delete);
    for (key, value) in initial.build_indexes() {
        tombstone.indexes.entry(key).or_insert(value);
    }

    MessageStore::put(provider, owner, &tombstone).await?;
    EventLog::append(provider, owner, &tombstone).await?;

    if delete.descriptor.prune {
        // the tombstone alone survives: every version and all data go
        for entry in &entries {
            if let Some(write) = entry.as_write() {
                DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid)
                    .await?;
            }
            let cid = entry.cid()?;
            if cid != delete.cid()? {
                MessageStore::delete(provider, owner, &cid).await?;
            }
        }
        purge_descendants(owner, &delete.descriptor.record_id, provider).await?;
    } else {
        delete_earlier(owner, delete, &entries, provider).await?;
    }

    EventStream::emit(provider, owner, &tombstone).await?;

    Ok(())
}

// Recursively purge a record's descendant records: messages and data are
// removed; the event log retains their history.
#[async_recursion]
async fn purge_descendants(owner: &str, record_id: &str, provider: &impl Provider) -> Result<()> {
    // fetch immediate children, including archived and deleted entries
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().parent_id(record_id))
        .build();
    let (children, _) = MessageStore::query(provider, owner, &query).await?;
    if children.is_empty() {
        return Ok(());
    }

    // a record can have several stored messages; group them
    let mut by_record: HashMap<String, Vec<Entry>> = HashMap::new();
    for entry in children {
        let child_id = match &entry.message {
            crate::store::EntryType::Write(write) => write.record_id.clone(),
            crate::store::EntryType::Delete(child) => child.descriptor.record_id.clone(),
            crate::store::EntryType::Configure(_) => {
                return Err(unexpected!("unexpected message type"));
            }
        };
        by_record.entry(child_id).or_default().push(entry);
    }

    for (child_id, entries) in by_record {
        // purge the child's own descendants first
        purge_descendants(owner, &child_id, provider).await?;

        for entry in entries {
            if let Some(write) = entry.as_write() {
                DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid)
                    .await?;
            }
            MessageStore::delete(provider, owner, &entry.cid()?).await?;
        }
    }

    Ok(())
}

// Delete all record versions older than the tombstone except the initial
// write, which is retained in an archived state without its data.
async fn delete_earlier(
    owner: &str, delete: &Delete, existing: &[Entry], provider: &impl Provider,
) -> Result<()> {
    // N.B. typically there will be at most two existing entries per record
    // (the initial write plus a subsequent write or delete)
    for entry in existing {
        if entry.descriptor().message_timestamp >= delete.descriptor.base.message_timestamp {
            continue;
        }
        let Some(write) = entry.as_write() else {
            continue;
        };

        // a deleted record's data is no longer reachable
        DataStore::delete(provider, owner, &write.record_id, &write.descriptor.data_cid).await?;

        if write.is_initial()? {
            let mut archived = Entry::from(write);
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

/// Builds a [`Delete`] message.
#[derive(Clone, Debug, Default)]
pub struct DeleteBuilder {
    record_id: Option<String>,
    prune: Option<bool>,
    message_timestamp: Option<DateTime<Utc>>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
}

impl DeleteBuilder {
    /// Returns a new [`DeleteBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// The ID of the record to delete.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Prune descendant records as well.
    #[must_use]
    pub const fn prune(mut self, prune: bool) -> Self {
        self.prune = Some(prune);
        self
    }

    /// The message's timestamp. Defaults to now.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// The protocol role invoked to authorize the message.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The ID of the permission grant invoked to authorize the message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical
    /// author.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Generate and sign the Delete message.
    ///
    /// # Errors
    ///
    /// Fails when no record ID is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Delete> {
        let Some(record_id) = self.record_id else {
            return Err(unexpected!("record ID not set"));
        };

        let descriptor = DeleteDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Delete,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            record_id,
            prune: self.prune.unwrap_or_default(),
        };

        let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
        if let Some(role) = self.protocol_role {
            builder = builder.protocol_role(role);
        }
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        let authorization = builder.build(signer).await?;

        Ok(Delete {
            descriptor,
            authorization,
        })
    }
}
