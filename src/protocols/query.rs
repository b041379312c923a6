//! # Protocols Query
//!
//! The protocols query endpoint handles `ProtocolsQuery` messages —
//! requests to fetch the protocol definitions installed on a web node.
//! Published definitions are visible to anyone; unpublished definitions
//! require the owner or a permission grant.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::Authorization;
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{MessageStore, Provider, Signer};
use crate::store::ProtocolsQuery;
use crate::{Descriptor, Interface, Method, Result, permissions, utils};

use super::Configure;

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the `MessageStore`.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    let published_only = query.authorize(owner, provider).await?;

    let store_query = ProtocolsQuery {
        protocol: query.descriptor.filter.as_ref().map(|f| f.protocol.clone()),
        published: if published_only { Some(true) } else { None },
    };
    let (entries, _) = MessageStore::query(provider, owner, &store_query.into()).await?;

    let entries: Vec<Configure> = entries
        .iter()
        .filter_map(|e| e.as_configure().cloned())
        .collect();
    let entries = if entries.is_empty() { None } else { Some(entries) };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply { entries }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Query {
    type Reply = QueryReply;

    fn cid(&self) -> Result<String> {
        utils::cid::from_value(self)
    }

    fn descriptor(&self) -> &Descriptor {
        &self.descriptor.base
    }

    fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Query {
    // Authorize the query, returning `true` when results must be
    // restricted to published definitions.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<bool> {
        let Some(authzn) = &self.authorization else {
            return Ok(true);
        };
        authzn
            .verify(provider)
            .await
            .map_err(|e| crate::Error::Unauthorized(format!("failed to authenticate: {e}")))?;

        let author = authzn.author()?;
        if author == owner {
            return Ok(false);
        }

        // a non-owner author may query unpublished definitions with a grant
        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            grant.verify(owner, self.descriptor(), provider).await?;
            grant.verify_protocol_scope(
                Interface::Protocols,
                self.descriptor.filter.as_ref().map(|f| f.protocol.as_str()),
            )?;
            return Ok(false);
        }

        Ok(true)
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// The matching protocol configurations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<Configure>>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter to apply when querying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<ProtocolsFilter>,
}

/// A filter on installed protocols.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolsFilter {
    /// The protocol URI to match.
    pub protocol: String,
}

/// Builds a [`Query`] message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: Option<ProtocolsFilter>,
    permission_grant_id: Option<String>,
    anonymous: bool,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter results to the specified protocol.
    #[must_use]
    pub fn filter(mut self, protocol: impl Into<String>) -> Self {
        self.filter = Some(ProtocolsFilter {
            protocol: protocol.into(),
        });
        self
    }

    /// Specify a permission grant ID to use for authorization.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Build the query without an authorization (published definitions
    /// only).
    #[must_use]
    pub const fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Generate and sign the Query message.
    ///
    /// # Errors
    ///
    /// Fails when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filter: self.filter,
        };

        let authorization = if self.anonymous {
            None
        } else {
            let mut builder =
                crate::authorization::AuthorizationBuilder::new().descriptor(&descriptor)?;
            if let Some(id) = self.permission_grant_id {
                builder = builder.permission_grant_id(id);
            }
            Some(builder.build(signer).await?)
        };

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
