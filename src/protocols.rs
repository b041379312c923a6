//! # Protocols
//!
//! Protocol definitions installed on a web node. A definition is a
//! declarative tree of record types with per-node action rules; the
//! [`crate::records`] handlers evaluate incoming messages against the
//! newest installed definition for their protocol.

mod configure;
mod query;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) use self::configure::fetch_definition;
pub use self::configure::{Configure, ConfigureBuilder, ConfigureDescriptor, ConfigureReply};
pub use self::query::{ProtocolsFilter, Query, QueryBuilder, QueryDescriptor, QueryReply};
use crate::SizeRange;

/// The URI of the reserved, first-class permissions protocol.
pub const PROTOCOL_URI: &str = "https://dwn.dev/permissions";

/// The protocol path of a permission request record.
pub const REQUEST_PATH: &str = "request";

/// The protocol path of a permission grant record.
pub const GRANT_PATH: &str = "grant";

/// The protocol path of a permission revocation record.
pub const REVOCATION_PATH: &str = "grant/revocation";

/// The maximum nesting depth of a protocol `structure`.
pub const MAX_NESTING_DEPTH: usize = 10;

/// A protocol definition: record types plus the structure of rule sets
/// governing them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Definition {
    /// The protocol URI.
    pub protocol: String,

    /// Whether the definition can be returned by unauthorized
    /// `ProtocolsQuery` messages.
    pub published: bool,

    /// Record types declared by the protocol.
    pub types: BTreeMap<String, ProtocolType>,

    /// Rule sets for records of each type, nested to mirror record
    /// parentage.
    pub structure: BTreeMap<String, RuleSet>,
}

/// A record type declared by a protocol.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolType {
    /// The schema records of this type must declare.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Data formats permitted for records of this type. Any format is
    /// permitted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_formats: Option<Vec<String>>,
}

/// The rule set governing records at one node of the protocol structure.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RuleSet {
    /// The action rules for records at this protocol path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$actions")]
    pub actions: Option<Vec<ActionRule>>,

    /// Records at this path are role records: writing one assigns the
    /// role to the record's recipient.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$role")]
    pub role: Option<bool>,

    /// Size limits for record data at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$size")]
    pub size: Option<SizeRange>,

    /// Tag constraints for records at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$tags")]
    pub tags: Option<Tags>,

    /// Nested rule sets for child record types.
    #[serde(flatten)]
    pub nested: BTreeMap<String, RuleSet>,
}

/// Tag constraints for a protocol path.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Tags {
    /// Tags that must be present on records at this path.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$requiredTags")]
    pub required_tags: Option<Vec<String>>,

    /// Allow tags other than those explicitly listed.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "$allowUndefinedTags")]
    pub allow_undefined_tags: Option<bool>,

    /// JSON schemas for individual tags, keyed by tag name.
    #[serde(flatten)]
    pub defined_tags: BTreeMap<String, Value>,
}

/// An action rule: who may perform which actions on records governed by
/// the rule set. Rules take three forms:
///
/// 1. Anyone can create: `{ who: "anyone", can: ["create"] }`
/// 2. Author or recipient of an ancestor can act:
///    `{ who: "recipient", of: "thread", can: ["create"] }`
/// 3. A role can act: `{ role: "thread/admin", can: ["create", "update"] }`
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRule {
    /// The actor the rule applies to. Mutually exclusive with `role`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub who: Option<Actor>,

    /// The protocol path of a role record type marked `$role: true`.
    /// Mutually exclusive with `who`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    /// The protocol path of the ancestor the actor relation is evaluated
    /// against. Required when `who` is `author` or `recipient`; prohibited
    /// when `who` is `anyone`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub of: Option<String>,

    /// The actions the actor or role can perform.
    pub can: Vec<Action>,
}

/// Actor types an action rule can reference.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Actor {
    /// Any entity, authenticated or not.
    #[default]
    Anyone,

    /// The author of the `of` ancestor record.
    Author,

    /// The recipient of the `of` ancestor record.
    Recipient,
}

/// Actions an action rule can permit.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Write the initial version of a record.
    Create,

    /// Delete a record authored by the actor.
    Delete,

    /// Recursively delete a record authored by the actor and its
    /// descendants.
    Prune,

    /// Query for records.
    Query,

    /// Subscribe to record events.
    Subscribe,

    /// Read a record.
    #[default]
    Read,

    /// Update a record created by the actor.
    Update,

    /// Delete a record regardless of author.
    #[serde(rename = "co-delete")]
    CoDelete,

    /// Prune a record regardless of author.
    #[serde(rename = "co-prune")]
    CoPrune,

    /// Update a record regardless of author.
    #[serde(rename = "co-update")]
    CoUpdate,
}

/// The built-in definition of the permissions protocol: permission
/// requests, grants, and revocations are ordinary protocol records under
/// this definition.
pub(crate) fn permissions_definition() -> Definition {
    let mut types = BTreeMap::new();
    types.insert(REQUEST_PATH.to_string(), ProtocolType {
        schema: Some(format!("{PROTOCOL_URI}/schemas/request")),
        data_formats: Some(vec!["application/json".to_string()]),
    });
    types.insert(GRANT_PATH.to_string(), ProtocolType {
        schema: Some(format!("{PROTOCOL_URI}/schemas/grant")),
        data_formats: Some(vec!["application/json".to_string()]),
    });
    types.insert("revocation".to_string(), ProtocolType {
        schema: Some(format!("{PROTOCOL_URI}/schemas/revocation")),
        data_formats: Some(vec!["application/json".to_string()]),
    });

    let mut structure = BTreeMap::new();
    structure.insert(REQUEST_PATH.to_string(), RuleSet {
        actions: Some(vec![ActionRule {
            who: Some(Actor::Anyone),
            can: vec![Action::Create],
            ..ActionRule::default()
        }]),
        ..RuleSet::default()
    });

    // grants are written by the tenant and read by their recipient (an
    // implicit entitlement); revocations are visible to anyone
    let mut grant_nested = BTreeMap::new();
    grant_nested.insert("revocation".to_string(), RuleSet {
        actions: Some(vec![ActionRule {
            who: Some(Actor::Anyone),
            can: vec![Action::Read],
            ..ActionRule::default()
        }]),
        ..RuleSet::default()
    });
    structure.insert(GRANT_PATH.to_string(), RuleSet {
        nested: grant_nested,
        ..RuleSet::default()
    });

    Definition {
        protocol: PROTOCOL_URI.to_string(),
        published: true,
        types,
        structure,
    }
}
