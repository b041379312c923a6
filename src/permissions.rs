//! # Permissions
//!
//! Permission grants let a tenant authorize another entity to perform
//! scoped actions against their web node. Requests, grants, and
//! revocations are ordinary `RecordsWrite` messages under the reserved
//! permissions protocol; a *delegated* grant additionally lets the grantee
//! act *as* the grantor.

mod grant;

use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};

pub use self::grant::{
    Grant, GrantBuilder, GrantData, RequestBuilder, RequestData, RevocationBuilder, RevocationData,
};
use crate::provider::MessageStore;
use crate::records::{RecordsFilter, Write};
use crate::store::RecordsQueryBuilder;
use crate::{Interface, Method, Result, forbidden, protocols};

/// Fetch the grant specified by `grant_id` from the message store.
///
/// # Errors
///
/// Fails with an authorization error when no grant with the given ID
/// exists in the latest base state.
pub(crate) async fn fetch_grant(
    owner: &str, grant_id: &str, store: &impl MessageStore,
) -> Result<Grant> {
    let query = RecordsQueryBuilder::new()
        .add_filter(RecordsFilter::new().record_id(grant_id))
        .build();
    let (entries, _) = store.query(owner, &query).await?;

    let Some(entry) = entries.first() else {
        return Err(forbidden!("no grant found"));
    };
    let Some(write) = entry.as_write() else {
        return Err(forbidden!("not a valid grant"));
    };

    Grant::try_from(write)
}

/// Resolve the permission scope of a permissions-protocol record: the
/// scope it requests, grants, or (for a revocation) the scope of the
/// grant it revokes.
pub(crate) async fn fetch_scope(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<Scope> {
    if write.descriptor.protocol.as_deref() != Some(protocols::PROTOCOL_URI) {
        return Err(forbidden!("record is not a permission record"));
    }
    let Some(encoded) = &write.encoded_data else {
        return Err(forbidden!("missing permission record data"));
    };
    let bytes = Base64UrlUnpadded::decode_vec(encoded)?;

    match write.descriptor.protocol_path.as_deref() {
        Some(protocols::REQUEST_PATH) => {
            let request: RequestData = serde_json::from_slice(&bytes)?;
            Ok(request.scope)
        }
        Some(protocols::GRANT_PATH) => {
            let grant: GrantData = serde_json::from_slice(&bytes)?;
            Ok(grant.scope)
        }
        Some(protocols::REVOCATION_PATH) => {
            let Some(grant_id) = &write.descriptor.parent_id else {
                return Err(forbidden!("revocation has no parent grant"));
            };
            let grant = fetch_grant(owner, grant_id, store).await?;
            Ok(grant.data.scope)
        }
        _ => Err(forbidden!("invalid permission record type")),
    }
}

/// The scope of a permission grant, keyed by the interface it applies to.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "interface")]
pub enum Scope {
    /// Scope applies to the `Records` interface.
    Records {
        /// The method the permission applies to.
        method: Method,

        /// The protocol the scope narrows to. Exactly one of `protocol`
        /// or `schema` must be set.
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,

        /// The schema the scope narrows to. Exactly one of `protocol` or
        /// `schema` must be set.
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,

        /// Optional further narrowing within the protocol.
        #[serde(flatten)]
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<RecordsOptions>,
    },

    /// Scope applies to the `Messages` interface.
    Messages {
        /// The method the permission applies to.
        method: Method,

        /// The protocol the scope narrows to, unrestricted when unset.
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },

    /// Scope applies to the `Protocols` interface.
    Protocols {
        /// The method the permission applies to.
        method: Method,

        /// The protocol the scope narrows to, unrestricted when unset.
        #[serde(skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
}

impl Default for Scope {
    fn default() -> Self {
        Self::Records {
            method: Method::default(),
            protocol: None,
            schema: None,
            options: None,
        }
    }
}

impl Scope {
    /// The interface the scope applies to.
    #[must_use]
    pub const fn interface(&self) -> Interface {
        match self {
            Self::Records { .. } => Interface::Records,
            Self::Messages { .. } => Interface::Messages,
            Self::Protocols { .. } => Interface::Protocols,
        }
    }

    /// The method the scope applies to.
    #[must_use]
    pub fn method(&self) -> Method {
        match self {
            Self::Records { method, .. }
            | Self::Messages { method, .. }
            | Self::Protocols { method, .. } => method.clone(),
        }
    }

    /// The protocol the scope narrows to, if any.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        match self {
            Self::Records { protocol, .. }
            | Self::Messages { protocol, .. }
            | Self::Protocols { protocol, .. } => protocol.as_deref(),
        }
    }

    /// Validate the scope's internal consistency.
    ///
    /// # Errors
    ///
    /// Fails when a `Records` scope does not narrow to exactly one of
    /// `protocol` or `schema`, or sets `options` without a protocol.
    pub fn validate(&self) -> Result<()> {
        let Self::Records {
            protocol,
            schema,
            options,
            ..
        } = self
        else {
            return Ok(());
        };

        match (protocol, schema) {
            (Some(_), Some(_)) => {
                Err(forbidden!("records scope must not set both protocol and schema"))
            }
            (None, None) => Err(forbidden!("records scope must set protocol or schema")),
            (None, Some(_)) if options.is_some() => {
                Err(forbidden!("records scope options require a protocol"))
            }
            _ => Ok(()),
        }
    }
}

/// Narrowing options for a `Records` scope: at most one of a context or a
/// protocol path.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RecordsOptions {
    /// Restrict the scope to records within the context.
    ContextId(String),

    /// Restrict the scope to records at the protocol path.
    ProtocolPath(String),
}

impl RecordsOptions {
    /// The context ID, when that is the narrowing in use.
    #[must_use]
    pub fn context_id(&self) -> Option<&str> {
        match self {
            Self::ContextId(id) => Some(id),
            Self::ProtocolPath(_) => None,
        }
    }

    /// The protocol path, when that is the narrowing in use.
    #[must_use]
    pub fn protocol_path(&self) -> Option<&str> {
        match self {
            Self::ProtocolPath(path) => Some(path),
            Self::ContextId(_) => None,
        }
    }
}

/// Conditions that must be met when a grant is used.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Conditions {
    /// Whether a message written with the grant must, or must not, be
    /// published. When unset, either is permitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publication: Option<ConditionPublication>,
}

/// Publication condition of a grant.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConditionPublication {
    /// The message must be marked as published.
    #[default]
    Required,

    /// The message must not be marked as published.
    Prohibited,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_scope_narrowing_is_exclusive() {
        let scope = Scope::Records {
            method: Method::Write,
            protocol: Some("https://example.com/chat".to_string()),
            schema: None,
            options: None,
        };
        assert!(scope.validate().is_ok());

        let scope = Scope::Records {
            method: Method::Write,
            protocol: None,
            schema: Some("https://example.com/note".to_string()),
            options: None,
        };
        assert!(scope.validate().is_ok());

        let scope = Scope::Records {
            method: Method::Write,
            protocol: Some("https://example.com/chat".to_string()),
            schema: Some("https://example.com/note".to_string()),
            options: None,
        };
        assert!(scope.validate().is_err());

        let scope = Scope::Records {
            method: Method::Write,
            protocol: None,
            schema: None,
            options: None,
        };
        assert!(scope.validate().is_err());
    }

    #[test]
    fn scope_options_require_protocol() {
        let scope = Scope::Records {
            method: Method::Write,
            protocol: None,
            schema: Some("https://example.com/note".to_string()),
            options: Some(RecordsOptions::ProtocolPath("chat".to_string())),
        };
        assert!(scope.validate().is_err());
    }
}
