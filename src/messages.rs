//! # Messages
//!
//! The messages interface: querying, reading, and subscribing to a
//! tenant's messages across every interface, chiefly for synchronization.
//! Access requires the owner or a permission grant with a `Messages`
//! scope.

mod query;
mod read;
mod subscribe;

use std::collections::BTreeMap;

use chrono::SecondsFormat::Micros;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::query::{Query, QueryBuilder, QueryDescriptor, QueryReply};
pub use self::read::{Read, ReadBuilder, ReadDescriptor, ReadReply, ReadReplyEntry};
pub use self::subscribe::{
    Subscribe, SubscribeBuilder, SubscribeDescriptor, SubscribeReply,
};
use crate::store::index::{self, FilterVal};
use crate::{DateRange, Interface, Method, Range};

/// A filter over messages of any interface.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessagesFilter {
    /// Messages of the specified interface.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<Interface>,

    /// Messages of the specified method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Messages associated with the specified protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Messages with a timestamp within the range.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_timestamp: Option<DateRange>,
}

impl MessagesFilter {
    /// Returns a new [`MessagesFilter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Match messages of the specified interface.
    #[must_use]
    pub const fn interface(mut self, interface: Interface) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Match messages of the specified method.
    #[must_use]
    pub const fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    /// Match messages associated with the specified protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Match messages with a timestamp within the range.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateRange) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// Evaluate the filter against an item's indexes.
    #[must_use]
    pub fn is_match(&self, indexes: &BTreeMap<String, Value>) -> bool {
        index::is_match(&self.to_filter_map(), indexes)
    }

    pub(crate) fn to_filter_map(&self) -> BTreeMap<String, FilterVal> {
        let mut map = BTreeMap::new();
        if let Some(interface) = &self.interface {
            map.insert(
                "interface".to_string(),
                FilterVal::Equal(Value::String(interface.to_string())),
            );
        }
        if let Some(method) = &self.method {
            map.insert("method".to_string(), FilterVal::Equal(Value::String(method.to_string())));
        }
        if let Some(protocol) = &self.protocol {
            map.insert("protocol".to_string(), FilterVal::Equal(Value::String(protocol.clone())));
        }
        if let Some(range) = &self.message_timestamp {
            let encode = |date: &chrono::DateTime<chrono::Utc>| {
                Value::String(date.to_rfc3339_opts(Micros, true))
            };
            map.insert(
                "messageTimestamp".to_string(),
                FilterVal::Range(Range {
                    gt: range.gt.as_ref().map(encode),
                    gte: range.gte.as_ref().map(encode),
                    lt: range.lt.as_ref().map(encode),
                    lte: range.lte.as_ref().map(encode),
                }),
            );
        }
        map
    }
}
