//! # Records
//!
//! The records interface: writing, deleting, reading, querying, and
//! subscribing to records. A record is the equivalence class of messages
//! sharing a `record_id`; its state is derived from the newest accepted
//! `Write` (the latest base state), any terminal `Delete`, and the
//! retained initial write.

mod delete;
pub(crate) mod protocol;
mod query;
mod read;
mod subscribe;
pub(crate) mod write;

use std::collections::BTreeMap;

use chrono::SecondsFormat::Micros;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::delete::{Delete, DeleteBuilder, DeleteDescriptor, DeleteReply};
pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply, QueryReplyEntry};
pub use self::read::{Read, ReadBuilder, ReadDescriptor, ReadReply, ReadReplyEntry};
pub use self::subscribe::{
    Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply,
};
pub use self::write::{
    Data, DelegatedGrant, SignaturePayload, Write, WriteBuilder, WriteDescriptor, WriteProtocol,
    WriteReply, entry_id,
};
pub use crate::data::DataStream;
use crate::provider::MessageStore;
use crate::store::index::FilterVal;
use crate::store::{Entry, RecordsQueryBuilder};
use crate::{DateRange, OneOrMany, Range, Result, utils};

/// A filter over records.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecordsFilter {
    /// Find a single record by its ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,

    /// Records by the specified author(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<OneOrMany<String>>,

    /// Records attested by the specified entity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attester: Option<String>,

    /// Records addressed to the specified recipient(s).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<OneOrMany<String>>,

    /// Records within the specified context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,

    /// Records with the specified structural parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    /// Records under the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Records at the specified protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_path: Option<String>,

    /// Records declaring the specified schema.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Records whose data is in the specified format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_format: Option<String>,

    /// Records carrying the specified tags.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeMap<String, TagFilter>>,

    /// Records whose data has the specified CID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_cid: Option<String>,

    /// Records whose data size is within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_size: Option<Range<usize>>,

    /// Records by publication state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<bool>,

    /// Records published within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_published: Option<DateRange>,

    /// Records created within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_created: Option<DateRange>,

    /// Records updated within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_updated: Option<DateRange>,
}

impl RecordsFilter {
    /// Normalize the filter's protocol and schema URLs.
    pub(crate) fn normalize(&self) -> Result<Self> {
        let mut filter = self.clone();
        if let Some(protocol) = &self.protocol {
            filter.protocol = Some(utils::clean_url(protocol)?);
        }
        if let Some(schema) = &self.schema {
            filter.schema = Some(utils::clean_url(schema)?);
        }
        Ok(filter)
    }

    /// Evaluate the filter against an item's indexes. Every set property
    /// must match.
    #[must_use]
    pub fn is_match(&self, indexes: &BTreeMap<String, Value>) -> bool {
        crate::store::index::is_match(&self.to_filter_map(), indexes)
    }

    // Lower the filter to property filters over index names.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn to_filter_map(&self) -> BTreeMap<String, FilterVal> {
        let mut map = BTreeMap::new();

        if let Some(record_id) = &self.record_id {
            map.insert("recordId".to_string(), FilterVal::Equal(Value::String(record_id.clone())));
        }
        if let Some(author) = &self.author {
            map.insert(
                "author".to_string(),
                FilterVal::OneOf(author.to_vec().into_iter().map(Value::String).collect()),
            );
        }
        if let Some(attester) = &self.attester {
            map.insert("attester".to_string(), FilterVal::Equal(Value::String(attester.clone())));
        }
        if let Some(recipient) = &self.recipient {
            map.insert(
                "recipient".to_string(),
                FilterVal::OneOf(recipient.to_vec().into_iter().map(Value::String).collect()),
            );
        }
        if let Some(context_id) = &self.context_id {
            // matches the context itself and any descendant context
            map.insert(
                "contextId".to_string(),
                FilterVal::Range(
                    Range::new()
                        .gte(Value::String(context_id.clone()))
                        .lte(Value::String(format!("{context_id}\u{ffff}"))),
                ),
            );
        }
        if let Some(parent_id) = &self.parent_id {
            map.insert("parentId".to_string(), FilterVal::Equal(Value::String(parent_id.clone())));
        }
        if let Some(protocol) = &self.protocol {
            map.insert("protocol".to_string(), FilterVal::Equal(Value::String(protocol.clone())));
        }
        if let Some(protocol_path) = &self.protocol_path {
            map.insert(
                "protocolPath".to_string(),
                FilterVal::Equal(Value::String(protocol_path.clone())),
            );
        }
        if let Some(schema) = &self.schema {
            map.insert("schema".to_string(), FilterVal::Equal(Value::String(schema.clone())));
        }
        if let Some(data_format) = &self.data_format {
            map.insert(
                "dataFormat".to_string(),
                FilterVal::Equal(Value::String(data_format.clone())),
            );
        }
        if let Some(tags) = &self.tags {
            for (tag, filter) in tags {
                map.insert(format!("tag.{tag}"), filter.to_filter_val());
            }
        }
        if let Some(data_cid) = &self.data_cid {
            map.insert("dataCid".to_string(), FilterVal::Equal(Value::String(data_cid.clone())));
        }
        if let Some(data_size) = &self.data_size {
            map.insert(
                "dataSize".to_string(),
                FilterVal::Range(Range {
                    gt: data_size.gt.map(Value::from),
                    gte: data_size.gte.map(Value::from),
                    lt: data_size.lt.map(Value::from),
                    lte: data_size.lte.map(Value::from),
                }),
            );
        }
        if let Some(published) = self.published {
            map.insert("published".to_string(), FilterVal::Equal(Value::Bool(published)));
        }
        if let Some(date_published) = &self.date_published {
            map.insert("datePublished".to_string(), date_range_filter(date_published));
        }
        if let Some(date_created) = &self.date_created {
            map.insert("dateCreated".to_string(), date_range_filter(date_created));
        }
        if let Some(date_updated) = &self.date_updated {
            map.insert("dateUpdated".to_string(), date_range_filter(date_updated));
        }

        map
    }

    /// Reduce the filter to its most selective indexable property, in
    /// priority order. The narrowed query is a superset of the full
    /// filter's matches; callers re-filter in memory. Returns `None` when
    /// no indexable property is set.
    #[must_use]
    pub fn to_concise(&self) -> Option<(String, FilterVal)> {
        let priority = [
            "recordId",
            "attester",
            "parentId",
            "recipient",
            "contextId",
            "protocolPath",
            "schema",
            "protocol",
            "dataCid",
            "dataSize",
            "datePublished",
            "dateCreated",
            "dateUpdated",
            "dataFormat",
            "published",
            "author",
        ];

        let map = self.to_filter_map();
        for property in priority {
            if let Some(filter_val) = map.get(property) {
                return Some((property.to_string(), filter_val.clone()));
            }
        }
        map.into_iter().next()
    }
}

fn date_range_filter(range: &DateRange) -> FilterVal {
    let encode = |date: &chrono::DateTime<chrono::Utc>| {
        Value::String(date.to_rfc3339_opts(Micros, true))
    };
    FilterVal::Range(Range {
        gt: range.gt.as_ref().map(encode),
        gte: range.gte.as_ref().map(encode),
        lt: range.lt.as_ref().map(encode),
        lte: range.lte.as_ref().map(encode),
    })
}

/// Implement builder-like behaviour.
impl RecordsFilter {
    /// Returns a new [`RecordsFilter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an author to the filter.
    #[must_use]
    pub fn add_author(mut self, author: impl Into<String>) -> Self {
        match &mut self.author {
            Some(OneOrMany::Many(existing)) => existing.push(author.into()),
            Some(OneOrMany::One(existing)) => {
                self.author = Some(OneOrMany::Many(vec![existing.clone(), author.into()]));
            }
            None => self.author = Some(OneOrMany::One(author.into())),
        }
        self
    }

    /// Add an attester to the filter.
    #[must_use]
    pub fn attester(mut self, attester: impl Into<String>) -> Self {
        self.attester = Some(attester.into());
        self
    }

    /// Add a recipient to the filter.
    #[must_use]
    pub fn add_recipient(mut self, recipient: impl Into<String>) -> Self {
        match &mut self.recipient {
            Some(OneOrMany::Many(existing)) => existing.push(recipient.into()),
            Some(OneOrMany::One(existing)) => {
                self.recipient = Some(OneOrMany::Many(vec![existing.clone(), recipient.into()]));
            }
            None => self.recipient = Some(OneOrMany::One(recipient.into())),
        }
        self
    }

    /// Add a protocol to the filter.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Add a protocol path to the filter.
    #[must_use]
    pub fn protocol_path(mut self, protocol_path: impl Into<String>) -> Self {
        self.protocol_path = Some(protocol_path.into());
        self
    }

    /// Add a schema to the filter.
    #[must_use]
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Add a published flag to the filter.
    #[must_use]
    pub const fn published(mut self, published: bool) -> Self {
        self.published = Some(published);
        self
    }

    /// Add a context ID to the filter.
    #[must_use]
    pub fn context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// Add a record ID to the filter.
    #[must_use]
    pub fn record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    /// Add a parent ID to the filter.
    #[must_use]
    pub fn parent_id(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Add a tag filter.
    #[must_use]
    pub fn add_tag(mut self, tag: impl Into<String>, filter: TagFilter) -> Self {
        self.tags.get_or_insert_with(BTreeMap::new).insert(tag.into(), filter);
        self
    }

    /// Add a data format to the filter.
    #[must_use]
    pub fn data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = Some(data_format.into());
        self
    }

    /// Add a data size range to the filter.
    #[must_use]
    pub const fn data_size(mut self, data_size: Range<usize>) -> Self {
        self.data_size = Some(data_size);
        self
    }

    /// Add a data CID to the filter.
    #[must_use]
    pub fn data_cid(mut self, data_cid: impl Into<String>) -> Self {
        self.data_cid = Some(data_cid.into());
        self
    }

    /// Add a created date range to the filter.
    #[must_use]
    pub const fn date_created(mut self, date_created: DateRange) -> Self {
        self.date_created = Some(date_created);
        self
    }

    /// Add a published date range to the filter.
    #[must_use]
    pub const fn date_published(mut self, date_published: DateRange) -> Self {
        self.date_published = Some(date_published);
        self
    }

    /// Add an updated date range to the filter.
    #[must_use]
    pub const fn date_updated(mut self, date_updated: DateRange) -> Self {
        self.date_updated = Some(date_updated);
        self
    }
}

/// A filter over a record tag's value.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum TagFilter {
    /// Match tags starting with the string value.
    StartsWith(String),

    /// Match tags within the range.
    Range(Range<usize>),

    /// Match the specified value.
    Equal(Value),
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::Equal(Value::Null)
    }
}

impl TagFilter {
    fn to_filter_val(&self) -> FilterVal {
        match self {
            Self::StartsWith(prefix) => FilterVal::Range(
                Range::new()
                    .gte(Value::String(prefix.clone()))
                    .lt(Value::String(format!("{prefix}\u{ffff}"))),
            ),
            Self::Range(range) => FilterVal::Range(Range {
                gt: range.gt.map(Value::from),
                gte: range.gte.map(Value::from),
                lt: range.lt.map(Value::from),
                lte: range.lte.map(Value::from),
            }),
            Self::Equal(value) => FilterVal::Equal(value.clone()),
        }
    }
}

/// Sort order for records query results.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Sort {
    /// Sort by `date_created`, oldest first.
    #[serde(rename = "createdAscending")]
    #[display("dateCreated")]
    CreatedAsc,

    /// Sort by `date_created`, newest first.
    #[serde(rename = "createdDescending")]
    #[display("dateCreated")]
    CreatedDesc,

    /// Sort by `date_published`, oldest first.
    #[serde(rename = "publishedAscending")]
    #[display("datePublished")]
    PublishedAsc,

    /// Sort by `date_published`, newest first.
    #[serde(rename = "publishedDescending")]
    #[display("datePublished")]
    PublishedDesc,

    /// Sort by `message_timestamp`, oldest first.
    #[default]
    #[serde(rename = "timestampAscending")]
    #[display("messageTimestamp")]
    TimestampAsc,

    /// Sort by `message_timestamp`, newest first.
    #[serde(rename = "timestampDescending")]
    #[display("messageTimestamp")]
    TimestampDesc,
}

impl Sort {
    /// Whether the sort is oldest-first.
    #[must_use]
    pub const fn is_ascending(&self) -> bool {
        matches!(self, Self::CreatedAsc | Self::PublishedAsc | Self::TimestampAsc)
    }
}

/// Fetch every stored message for the record, oldest first, including
/// archived entries.
pub(crate) async fn existing_entries(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Vec<Entry>> {
    let query = RecordsQueryBuilder::new()
        .method(None)
        .include_archived(true)
        .add_filter(RecordsFilter::new().record_id(record_id))
        .sort(Sort::TimestampAsc)
        .build();
    let (entries, _) = store.query(owner, &query).await?;
    Ok(entries)
}

/// Fetch the initial write of the record, when one exists.
pub(crate) async fn initial_write(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Option<Write>> {
    let entries = existing_entries(owner, record_id, store).await?;
    for entry in &entries {
        if let Some(write) = entry.as_write() {
            if write.is_initial()? {
                return Ok(Some(write.clone()));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concise_filter_priority() {
        let filter = RecordsFilter::new()
            .protocol("https://example.com/chat")
            .schema("https://example.com/message")
            .record_id("bafyrecord");
        let (property, _) = filter.to_concise().expect("should select");
        assert_eq!(property, "recordId");

        let filter = RecordsFilter::new()
            .protocol("https://example.com/chat")
            .schema("https://example.com/message");
        let (property, _) = filter.to_concise().expect("should select");
        assert_eq!(property, "schema");

        let filter = RecordsFilter::new().protocol("https://example.com/chat");
        let (property, _) = filter.to_concise().expect("should select");
        assert_eq!(property, "protocol");

        assert!(RecordsFilter::new().to_concise().is_none());
    }

    #[test]
    fn concise_filter_is_superset() {
        // every index set matching the full filter also matches the concise
        // filter
        let filter = RecordsFilter::new()
            .protocol("https://example.com/chat")
            .protocol_path("thread/chat")
            .published(true);
        let (property, concise) = filter.to_concise().expect("should select");

        let indexes = BTreeMap::from([
            ("protocol".to_string(), Value::String("https://example.com/chat".to_string())),
            ("protocolPath".to_string(), Value::String("thread/chat".to_string())),
            ("published".to_string(), Value::Bool(true)),
        ]);
        assert!(filter.is_match(&indexes));

        let narrowed = BTreeMap::from([(property, concise)]);
        assert!(crate::store::index::is_match(&narrowed, &indexes));
    }
}
