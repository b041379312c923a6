//! # Messages Query
//!
//! The messages query endpoint handles `MessagesQuery` messages —
//! requests to query the event log for matching persisted messages of
//! any type.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::MessagesFilter;
use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{EventLog, Provider, Signer};
use crate::store::Cursor;
use crate::{Descriptor, Error, Interface, Method, Result, forbidden, permissions, utils};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the event log.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.authorize(owner, provider).await?;

    let store_query = crate::store::Query::from(query.descriptor.filters.clone());
    let (events, cursor) = EventLog::query(provider, owner, &store_query).await?;

    let events =
        events.iter().map(|event| event.cid().unwrap_or_default()).collect::<Vec<String>>();
    let entries = if events.is_empty() { None } else { Some(events) };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply { entries, cursor }),
    })
}

/// The [`Query`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    /// The Query descriptor.
    pub descriptor: QueryDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Query {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        authzn
            .verify(provider)
            .await
            .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;

        let author = authzn.author()?;
        if author == owner {
            return Ok(());
        }

        // non-owner queries require a grant
        let Some(grant_id) = authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("author has no grant"));
        };
        let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
        if grant.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        if grant.grantor != owner {
            return Err(forbidden!("grant not granted by web node owner"));
        }
        grant.verify(owner, self.descriptor(), provider).await?;

        // when the grant is protocol-scoped, every filter must match it
        if let Some(protocol) = grant.data.scope.protocol() {
            for filter in &self.descriptor.filters {
                if filter.protocol.as_deref() != Some(protocol) {
                    return Err(forbidden!("filter and grant protocols do not match"));
                }
            }
        }

        Ok(())
    }
}

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// The CIDs of messages matching the query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<String>>,

    /// The watermark cursor to resume from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters to apply when querying for messages.
    pub filters: Vec<MessagesFilter>,

    /// The watermark cursor returned by a previous query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// Builds a [`Query`] message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filters: Vec<MessagesFilter>,
    permission_grant_id: Option<String>,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the query.
    #[must_use]
    pub fn add_filter(mut self, filter: MessagesFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// The ID of the permission grant invoked to authorize the message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
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
                interface: Interface::Messages,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filters: self.filters,
            cursor: None,
        };

        let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
