//! # Decentralized Web Node (DWN)
//!
//! A per-tenant, personal datastore whose records are authored, signed, and
//! retrieved across identity boundaries. The library accepts signed messages
//! addressed to a tenant (a DID) and enforces a uniform lifecycle on them:
//! authenticate the signer(s), authorize the action against the tenant's
//! installed protocols and permission grants, resolve conflicts against any
//! existing versions of the record, persist the message plus its payload
//! data, and notify subscribers.
//!
//! Storage, DID resolution, and signing are supplied by the caller through
//! the [`provider::Provider`] traits. Messages are dispatched through
//! [`endpoint::handle`].

pub mod authorization;
pub mod data;
pub mod endpoint;
mod error;
pub mod event;
pub mod jws;
pub mod messages;
pub mod permissions;
pub mod protocols;
pub mod provider;
pub mod records;
mod schema;
pub mod store;
pub mod tasks;
mod utils;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

pub use crate::endpoint::Message;
pub use crate::error::Error;

/// Result type for `DWN` handlers.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The message descriptor component common to all messages.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// The associated web node interface.
    pub interface: Interface,

    /// The interface method.
    pub method: Method,

    /// The timestamp of the message.
    #[serde(with = "utils::rfc3339_micros")]
    pub message_timestamp: DateTime<Utc>,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            interface: Interface::default(),
            method: Method::default(),
            message_timestamp: Utc::now(),
        }
    }
}

/// Web node interfaces.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Interface {
    /// Records interface.
    #[default]
    Records,

    /// Protocols interface.
    Protocols,

    /// Messages interface.
    Messages,
}

/// Interface methods.
#[derive(Clone, Debug, Default, Display, Deserialize, Serialize, PartialEq, Eq)]
pub enum Method {
    /// Write method.
    Write,

    /// Delete method.
    Delete,

    /// Read method.
    #[default]
    Read,

    /// Query method.
    Query,

    /// Subscribe method.
    Subscribe,

    /// Configure method.
    Configure,
}

/// One or more values, serialized without an array wrapper when singular.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    /// A single value.
    One(T),

    /// A set of values.
    Many(Vec<T>),
}

impl<T: Default> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::One(T::default())
    }
}

impl<T: Clone> OneOrMany<T> {
    /// Return the value(s) as a `Vec`.
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value.clone()],
            Self::Many(values) => values.clone(),
        }
    }
}

impl<T: Clone + PartialEq> OneOrMany<T> {
    /// Check whether the value is contained in the set.
    pub fn contains(&self, value: &T) -> bool {
        match self {
            Self::One(one) => one == value,
            Self::Many(many) => many.contains(value),
        }
    }
}

/// A half- or fully-bounded range filter over an ordered type.
///
/// Any combination of the bounds may be set. An unset bound is unbounded.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Range<T> {
    /// Greater than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gt: Option<T>,

    /// Greater than or equal to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gte: Option<T>,

    /// Less than.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lt: Option<T>,

    /// Less than or equal to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lte: Option<T>,
}

impl<T: PartialOrd> Range<T> {
    /// Check whether `value` falls within the range.
    pub fn contains(&self, value: &T) -> bool {
        if let Some(gt) = &self.gt {
            if value <= gt {
                return false;
            }
        }
        if let Some(gte) = &self.gte {
            if value < gte {
                return false;
            }
        }
        if let Some(lt) = &self.lt {
            if value >= lt {
                return false;
            }
        }
        if let Some(lte) = &self.lte {
            if value > lte {
                return false;
            }
        }
        true
    }
}

impl<T> Range<T> {
    /// Returns an unbounded range.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            gt: None,
            gte: None,
            lt: None,
            lte: None,
        }
    }

    /// Set the lower bound (exclusive).
    #[must_use]
    pub fn gt(mut self, gt: T) -> Self {
        self.gt = Some(gt);
        self
    }

    /// Set the lower bound (inclusive).
    #[must_use]
    pub fn gte(mut self, gte: T) -> Self {
        self.gte = Some(gte);
        self
    }

    /// Set the upper bound (exclusive).
    #[must_use]
    pub fn lt(mut self, lt: T) -> Self {
        self.lt = Some(lt);
        self
    }

    /// Set the upper bound (inclusive).
    #[must_use]
    pub fn lte(mut self, lte: T) -> Self {
        self.lte = Some(lte);
        self
    }
}

/// A date range filter (bounds inclusive of the microsecond).
pub type DateRange = Range<DateTime<Utc>>;

/// Record size limits declared by a protocol rule set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SizeRange {
    /// The minimum size, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,

    /// The maximum size, in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}
