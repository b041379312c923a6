//! # Records Query
//!
//! The records query endpoint handles `RecordsQuery` messages — requests
//! to query the message store for matching [`Write`] records. The filters
//! executed encode the viewer's authority: the owner sees everything,
//! anonymous viewers see published records, and other viewers see the
//! union of published records, records they authored, records addressed
//! to them, and any role-authorized set.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::protocols::Action;
use crate::provider::{MessageStore, Provider, Signer};
use crate::records::{self, DelegatedGrant, RecordsFilter, Sort, Write, protocol};
use crate::store::{self, Cursor, Pagination, RecordsQueryBuilder};
use crate::{
    Descriptor, Error, Interface, Method, Result, forbidden, invalid, permissions, utils,
};

/// Handle — or process — a [`Query`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs querying the message store.
pub async fn handle(
    owner: &str, query: Query, provider: &impl Provider,
) -> Result<Reply<QueryReply>> {
    query.validate()?;

    let store_query = if query.only_published() {
        // unauthenticated queries are limited to published records
        let mut filter = query.descriptor.filter.clone();
        filter.published = Some(true);
        query.to_store_query(vec![filter])
    } else {
        query.authorize(owner, provider).await?;
        let Some(authzn) = &query.authorization else {
            return Err(forbidden!("missing authorization"));
        };

        if authzn.author()? == owner {
            query.to_store_query(vec![query.descriptor.filter.clone()])
        } else {
            query.non_owner_query()?
        }
    };

    let (entries, cursor) = MessageStore::query(provider, owner, &store_query).await?;
    if entries.is_empty() {
        return Ok(Reply {
            status: Status {
                code: StatusCode::OK.as_u16(),
                detail: None,
            },
            body: None,
        });
    }

    // attach each record's initial write when the entry is a later version
    let mut reply_entries = Vec::new();
    for entry in entries {
        let write: Write = (&entry).try_into()?;

        let initial_write = if write.is_initial()? {
            None
        } else {
            let Some(mut initial) =
                records::initial_write(owner, &write.record_id, provider).await?
            else {
                return Err(crate::unexpected!("initial write not found"));
            };
            initial.encoded_data = None;
            Some(initial)
        };

        reply_entries.push(QueryReplyEntry {
            write,
            initial_write,
        });
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(QueryReply {
            entries: Some(reply_entries),
            cursor,
        }),
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

/// [`QueryReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReply {
    /// The matching entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<QueryReplyEntry>>,

    /// The pagination cursor, set when more results remain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
}

/// A single [`Write`] entry returned by the query.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryReplyEntry {
    /// The latest `RecordsWrite` of the record.
    #[serde(flatten)]
    pub write: Write,

    /// The record's initial write, set when the returned message is not
    /// itself the initial write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,
}

/// The [`Query`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter to match records against.
    pub filter: RecordsFilter,

    /// The sort order for results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_sort: Option<Sort>,

    /// Pagination settings.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagination: Option<Pagination>,
}

impl Query {
    fn validate(&self) -> Result<()> {
        if let Some(protocol) = &self.descriptor.filter.protocol {
            utils::uri::validate(protocol)?;
        }
        if let Some(schema) = &self.descriptor.filter.schema {
            utils::uri::validate(schema)?;
        }

        // sorting unpublished records by publish date is unsatisfiable
        if self.descriptor.filter.published == Some(false)
            && matches!(
                self.descriptor.date_sort,
                Some(Sort::PublishedAsc | Sort::PublishedDesc)
            )
        {
            return Err(invalid!(
                "cannot sort by `date_published` when querying for unpublished records"
            ));
        }

        Ok(())
    }

    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        authzn
            .verify(provider)
            .await
            .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;
        let author = authzn.author()?;

        // an author delegate queries within the delegated grant's scope;
        // the grant names the signer as grantee and the author as grantor
        if let Some(delegated) = &authzn.author_delegated_grant {
            let grant = delegated.to_grant()?;
            grant.verify_delegated(&author, &authzn.signer()?)?;
            grant
                .permit_query(
                    owner,
                    &authzn.signer()?,
                    self.descriptor(),
                    &self.descriptor.filter,
                    provider,
                )
                .await?;
        }

        if author == owner {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            if grant.grantor != owner {
                return Err(forbidden!("grant not granted by web node owner"));
            }
            grant
                .permit_query(owner, &author, self.descriptor(), &self.descriptor.filter, provider)
                .await?;
        }

        // a query invoking a protocol role must hold the role
        if let Some(role) = authzn.payload()?.protocol_role {
            protocol::permit_query(
                owner,
                &author,
                &role,
                Action::Query,
                &self.descriptor.filter,
                provider,
            )
            .await?;
        }

        Ok(())
    }

    // An unauthenticated query, or one whose settings imply published
    // records, is limited to published records.
    fn only_published(&self) -> bool {
        if let Some(published) = self.descriptor.filter.published {
            return published;
        }
        if self.descriptor.filter.date_published.is_some() {
            return true;
        }
        if matches!(
            self.descriptor.date_sort,
            Some(Sort::PublishedAsc | Sort::PublishedDesc)
        ) {
            return true;
        }
        self.authorization.is_none()
    }

    // Build the store query executed when the viewer is not the owner:
    // the union of published records, records the viewer authored, records
    // addressed to the viewer, and (when a role is invoked) the
    // role-authorized set.
    fn non_owner_query(&self) -> Result<store::Query> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let author = authzn.author()?;
        let base = &self.descriptor.filter;
        let mut filters = Vec::new();

        // published records are visible to any viewer
        if base.published.is_none() {
            filters.push(base.clone().published(true));
        }

        // unpublished records the viewer authored
        let mut authored = base.clone();
        authored.author = None;
        filters.push(authored.add_author(&author).published(false));

        // unpublished records addressed to the viewer
        let mut addressed = base.clone();
        addressed.recipient = None;
        filters.push(addressed.add_recipient(&author).published(false));

        // the role-authorized set when a role is invoked
        if authzn.payload()?.protocol_role.is_some() {
            filters.push(base.clone().published(false));
        }

        Ok(self.to_store_query(filters))
    }

    fn to_store_query(&self, filters: Vec<RecordsFilter>) -> store::Query {
        let mut builder = RecordsQueryBuilder::new();
        for filter in filters {
            builder = builder.add_filter(filter);
        }
        if let Some(date_sort) = &self.descriptor.date_sort {
            builder = builder.sort(date_sort.clone());
        }
        if let Some(pagination) = &self.descriptor.pagination {
            builder = builder.pagination(pagination.clone());
        }
        builder.build()
    }
}

/// Builds a [`Query`] message.
#[derive(Clone, Debug, Default)]
pub struct QueryBuilder {
    filter: RecordsFilter,
    date_sort: Option<Sort>,
    pagination: Option<Pagination>,
    protocol_role: Option<String>,
    permission_grant_id: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    anonymous: bool,
}

impl QueryBuilder {
    /// Returns a new [`QueryBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The filter to match records against.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// The sort order for results.
    #[must_use]
    pub fn date_sort(mut self, date_sort: Sort) -> Self {
        self.date_sort = Some(date_sort);
        self
    }

    /// Pagination settings.
    #[must_use]
    pub fn pagination(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
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

    /// Build the query without an authorization (published records only).
    #[must_use]
    pub const fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Generate and sign the Query message.
    ///
    /// # Errors
    ///
    /// Fails when the filter is invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Query> {
        let descriptor = QueryDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Query,
                message_timestamp: chrono::Utc::now(),
            },
            filter: self.filter.normalize()?,
            date_sort: self.date_sort,
            pagination: self.pagination,
        };

        let authorization = if self.anonymous {
            None
        } else {
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
            Some(builder.build(signer).await?)
        };

        Ok(Query {
            descriptor,
            authorization,
        })
    }
}
