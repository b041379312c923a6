//! # Store
//!
//! Store-facing message wrappers and query types. An [`Entry`] couples a
//! message with the flattened indexes used for filtering; [`Query`] is the
//! filter set a store evaluates, with sorting and opaque-cursor pagination
//! for records queries.

pub(crate) mod block;
pub mod index;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::endpoint::Message;
use crate::messages::MessagesFilter;
use crate::protocols::Configure;
use crate::records::{Delete, RecordsFilter, Sort, Write};
use crate::{Descriptor, Interface, Method, Result, unexpected};

/// An entry of the message store: a message plus its queryable indexes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Entry {
    /// The stored message.
    #[serde(flatten)]
    pub message: EntryType,

    /// Indexes derived from the message's descriptor and authorization.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub indexes: BTreeMap<String, Value>,
}

/// The message types a store entry may hold.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EntryType {
    /// A `RecordsWrite` message.
    Write(Write),

    /// A `RecordsDelete` message.
    Delete(Delete),

    /// A `ProtocolsConfigure` message.
    Configure(Configure),
}

impl Entry {
    /// Compute the CID of the wrapped message.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized to CBOR.
    pub fn cid(&self) -> Result<String> {
        match &self.message {
            EntryType::Write(write) => write.cid(),
            EntryType::Delete(delete) => delete.cid(),
            EntryType::Configure(configure) => configure.cid(),
        }
    }

    /// The base descriptor of the wrapped message.
    #[must_use]
    pub fn descriptor(&self) -> &Descriptor {
        match &self.message {
            EntryType::Write(write) => &write.descriptor.base,
            EntryType::Delete(delete) => &delete.descriptor.base,
            EntryType::Configure(configure) => &configure.descriptor.base,
        }
    }

    /// The wrapped `RecordsWrite`, if that is what this entry holds.
    #[must_use]
    pub const fn as_write(&self) -> Option<&Write> {
        match &self.message {
            EntryType::Write(write) => Some(write),
            _ => None,
        }
    }

    /// The wrapped `RecordsDelete`, if that is what this entry holds.
    #[must_use]
    pub const fn as_delete(&self) -> Option<&Delete> {
        match &self.message {
            EntryType::Delete(delete) => Some(delete),
            _ => None,
        }
    }

    /// The wrapped `ProtocolsConfigure`, if that is what this entry holds.
    #[must_use]
    pub const fn as_configure(&self) -> Option<&Configure> {
        match &self.message {
            EntryType::Configure(configure) => Some(configure),
            _ => None,
        }
    }

    /// Add (or replace) an index.
    pub fn add_index(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.indexes.insert(key.into(), value.into());
    }
}

impl From<&Write> for Entry {
    fn from(write: &Write) -> Self {
        Self {
            message: EntryType::Write(write.clone()),
            indexes: write.build_indexes(),
        }
    }
}

impl From<&Delete> for Entry {
    fn from(delete: &Delete) -> Self {
        Self {
            message: EntryType::Delete(delete.clone()),
            indexes: delete.build_indexes(),
        }
    }
}

impl From<&Configure> for Entry {
    fn from(configure: &Configure) -> Self {
        Self {
            message: EntryType::Configure(configure.clone()),
            indexes: configure.build_indexes(),
        }
    }
}

/// A store query: an OR of filters, each an AND of property filters.
#[derive(Clone, Debug)]
pub enum Query {
    /// Query for records entries.
    Records(RecordsQuery),

    /// Query over all message types (event-log queries).
    Messages(MessagesQuery),

    /// Query for protocol configurations.
    Protocols(ProtocolsQuery),

    /// Query for messages authorized by a permission grant.
    Granted(GrantedQuery),
}

impl Query {
    /// Evaluate the query against an entry's indexes. Used by store
    /// implementations to re-filter in memory after any index-level
    /// narrowing.
    #[must_use]
    pub fn is_match(&self, entry: &Entry) -> bool {
        match self {
            Self::Records(query) => query.is_match(entry),
            Self::Messages(query) => query.is_match(entry),
            Self::Protocols(query) => query.is_match(entry),
            Self::Granted(query) => query.is_match(entry),
        }
    }
}

/// Query for messages that cited a permission grant, at or after a given
/// timestamp. Used by the revocation cascade.
#[derive(Clone, Debug)]
pub struct GrantedQuery {
    /// The ID of the cited permission grant.
    pub permission_grant_id: String,

    /// Match messages with a timestamp at or after this datetime.
    pub from: chrono::DateTime<chrono::Utc>,
}

impl GrantedQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        if entry.indexes.get("permissionGrantId")
            != Some(&Value::String(self.permission_grant_id.clone()))
        {
            return false;
        }
        let timestamp = self.from.to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
        let Some(Value::String(entry_timestamp)) = entry.indexes.get("messageTimestamp") else {
            return false;
        };
        entry_timestamp.as_str() >= timestamp.as_str()
    }
}

impl From<GrantedQuery> for Query {
    fn from(query: GrantedQuery) -> Self {
        Self::Granted(query)
    }
}

/// Query for records entries.
#[derive(Clone, Debug)]
pub struct RecordsQuery {
    /// Filters (OR'ed) to apply.
    pub filters: Vec<RecordsFilter>,

    /// Restrict matches to a single method. `None` matches both `Write`
    /// and `Delete` entries.
    pub method: Option<Method>,

    /// Include entries no longer in the latest base state (superseded
    /// initial writes and data-less writes).
    pub include_archived: bool,

    /// Sort order for results.
    pub sort: Sort,

    /// Pagination settings.
    pub pagination: Option<Pagination>,
}

impl Default for RecordsQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            method: Some(Method::Write),
            include_archived: false,
            sort: Sort::default(),
            pagination: None,
        }
    }
}

impl RecordsQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        let descriptor = entry.descriptor();
        if descriptor.interface != Interface::Records {
            return false;
        }
        if let Some(method) = &self.method {
            if &descriptor.method != method {
                return false;
            }
        } else if descriptor.method == Method::Configure {
            return false;
        }
        if !self.include_archived
            && entry.indexes.get("archived") == Some(&Value::Bool(true))
        {
            return false;
        }
        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|filter| filter.is_match(&entry.indexes))
    }

    /// Sort matched entries and apply pagination, returning the page and,
    /// when more results remain, an opaque cursor for the next page.
    ///
    /// # Errors
    ///
    /// Fails when an entry cannot be serialized for its CID.
    pub fn sort_and_paginate(&self, mut entries: Vec<Entry>) -> Result<(Vec<Entry>, Option<Cursor>)> {
        let property = self.sort.to_string();

        // sort key: encoded index value with the message CID as tiebreak
        let mut keyed = Vec::with_capacity(entries.len());
        for entry in entries.drain(..) {
            let value = entry
                .indexes
                .get(&property)
                .map(index::encode_value)
                .unwrap_or_default();
            let cid = entry.cid()?;
            keyed.push((value, cid, entry));
        }
        keyed.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        if !self.sort.is_ascending() {
            keyed.reverse();
        }

        // seek past the cursor
        if let Some(cursor) = self.pagination.as_ref().and_then(|p| p.cursor.as_ref()) {
            let key = (&cursor.value, &cursor.message_cid);
            keyed.retain(|(value, cid, _)| {
                if self.sort.is_ascending() {
                    (value, cid) > key
                } else {
                    (value, cid) < key
                }
            });
        }

        // apply the limit, returning a cursor when more entries remain
        let limit = self.pagination.as_ref().and_then(|p| p.limit);
        let mut cursor = None;
        if let Some(limit) = limit {
            if keyed.len() > limit {
                keyed.truncate(limit);
                if let Some((value, cid, _)) = keyed.last() {
                    cursor = Some(Cursor {
                        message_cid: cid.clone(),
                        value: value.clone(),
                    });
                }
            }
        }

        Ok((keyed.into_iter().map(|(_, _, entry)| entry).collect(), cursor))
    }
}

/// Builds a [`RecordsQuery`].
#[derive(Clone, Debug, Default)]
pub struct RecordsQueryBuilder {
    query: RecordsQuery,
}

impl RecordsQueryBuilder {
    /// Returns a new [`RecordsQueryBuilder`] matching latest-state `Write`
    /// entries.
    #[must_use]
    pub fn new() -> Self {
        Self {
            query: RecordsQuery::default(),
        }
    }

    /// Restrict matches to the specified method (`None` matches `Write` and
    /// `Delete`).
    #[must_use]
    pub fn method(mut self, method: Option<Method>) -> Self {
        self.query.method = method;
        self
    }

    /// Include archived entries in results.
    #[must_use]
    pub const fn include_archived(mut self, include_archived: bool) -> Self {
        self.query.include_archived = include_archived;
        self
    }

    /// Add a filter to the query.
    #[must_use]
    pub fn add_filter(mut self, filter: RecordsFilter) -> Self {
        self.query.filters.push(filter);
        self
    }

    /// Set the sort order.
    #[must_use]
    pub fn sort(mut self, sort: Sort) -> Self {
        self.query.sort = sort;
        self
    }

    /// Set the pagination settings.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.query.pagination = Some(pagination);
        self
    }

    /// Build the query.
    #[must_use]
    pub fn build(self) -> Query {
        Query::Records(self.query)
    }
}

/// Query over all message types.
#[derive(Clone, Debug, Default)]
pub struct MessagesQuery {
    /// Filters (OR'ed) to apply.
    pub filters: Vec<MessagesFilter>,
}

impl MessagesQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        self.filters.iter().any(|filter| filter.is_match(&entry.indexes))
    }
}

impl From<Vec<MessagesFilter>> for Query {
    fn from(filters: Vec<MessagesFilter>) -> Self {
        Self::Messages(MessagesQuery { filters })
    }
}

/// Query for protocol configurations.
#[derive(Clone, Debug, Default)]
pub struct ProtocolsQuery {
    /// Match configurations of this protocol.
    pub protocol: Option<String>,

    /// Match configurations by their published flag.
    pub published: Option<bool>,
}

impl ProtocolsQuery {
    fn is_match(&self, entry: &Entry) -> bool {
        let descriptor = entry.descriptor();
        if descriptor.interface != Interface::Protocols || descriptor.method != Method::Configure {
            return false;
        }
        if let Some(protocol) = &self.protocol {
            if entry.indexes.get("protocol") != Some(&Value::String(protocol.clone())) {
                return false;
            }
        }
        if let Some(published) = self.published {
            if entry.indexes.get("published") != Some(&Value::Bool(published)) {
                return false;
            }
        }
        true
    }
}

impl From<ProtocolsQuery> for Query {
    fn from(query: ProtocolsQuery) -> Self {
        Self::Protocols(query)
    }
}

/// Pagination settings for a query.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Maximum number of entries to return.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// The cursor returned by the previous page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

impl Pagination {
    /// Returns a new [`Pagination`] with the specified limit.
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            cursor: None,
        }
    }

    /// Set the cursor to resume from.
    #[must_use]
    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// A pagination cursor, opaque to callers.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    /// The CID of the last message of the previous page.
    pub message_cid: String,

    /// The sort value of the last message of the previous page.
    pub value: String,
}

impl TryFrom<Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: Entry) -> Result<Self> {
        match entry.message {
            EntryType::Write(write) => Ok(write),
            _ => Err(unexpected!("expected `RecordsWrite` message")),
        }
    }
}

impl TryFrom<&Entry> for Write {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Write(write) => Ok(write.clone()),
            _ => Err(unexpected!("expected `RecordsWrite` message")),
        }
    }
}

impl TryFrom<Entry> for Delete {
    type Error = crate::Error;

    fn try_from(entry: Entry) -> Result<Self> {
        match entry.message {
            EntryType::Delete(delete) => Ok(delete),
            _ => Err(unexpected!("expected `RecordsDelete` message")),
        }
    }
}

impl TryFrom<&Entry> for Delete {
    type Error = crate::Error;

    fn try_from(entry: &Entry) -> Result<Self> {
        match &entry.message {
            EntryType::Delete(delete) => Ok(delete.clone()),
            _ => Err(unexpected!("expected `RecordsDelete` message")),
        }
    }
}
