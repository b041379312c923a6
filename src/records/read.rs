//! # Records Read
//!
//! The records read endpoint handles `RecordsRead` messages — requests to
//! fetch a single record along with its payload. A deleted record
//! returns its tombstone and initial write with a not-found status, after
//! authorization.

use base64ct::{Base64UrlUnpadded, Encoding};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::data::DataStream;
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{Provider, Signer};
use crate::records::{self, Delete, DelegatedGrant, RecordsFilter, Write, protocol};
use crate::store::RecordsQueryBuilder;
use crate::{Descriptor, Error, Interface, Method, Result, forbidden, permissions, unexpected, utils};

/// Handle — or process — a [`Read`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs fetching the record.
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    // fetch the record's latest state, tombstone included
    let query = RecordsQueryBuilder::new()
        .method(None)
        .add_filter(read.descriptor.filter.clone())
        .build();
    let (entries, _) = crate::provider::MessageStore::query(provider, owner, &query).await?;
    if entries.is_empty() {
        return Err(Error::NotFound("no matching record found".to_string()));
    }
    if entries.len() > 1 {
        return Err(unexpected!("multiple messages exist"));
    }

    // a deleted record surfaces its tombstone and initial write
    if entries[0].descriptor().method == Method::Delete {
        let delete = Delete::try_from(&entries[0])?;
        let Some(mut initial) =
            records::initial_write(owner, &delete.descriptor.record_id, provider).await?
        else {
            return Err(unexpected!("initial write for deleted record not found"));
        };

        // the viewer must be able to read the record to see its tombstone
        read.authorize(owner, &initial, provider).await?;

        initial.encoded_data = None;
        return Ok(Reply {
            status: Status {
                code: StatusCode::NOT_FOUND.as_u16(),
                detail: Some("record is deleted".to_string()),
            },
            body: Some(ReadReply {
                entry: ReadReplyEntry {
                    records_write: None,
                    records_delete: Some(delete),
                    initial_write: Some(initial),
                    data: None,
                },
            }),
        });
    }

    let mut write = Write::try_from(&entries[0])?;
    read.authorize(owner, &write, provider).await?;

    // the payload is either embedded or resolved from the data store
    let data = if let Some(encoded) = write.encoded_data.take() {
        let buffer = Base64UrlUnpadded::decode_vec(&encoded)?;
        Some(DataStream::from(buffer))
    } else {
        DataStream::from_store(owner, &write.record_id, &write.descriptor.data_cid, provider)
            .await?
    };

    // attach the initial write when the latest version is a later version
    let initial_write = if write.is_initial()? {
        None
    } else {
        let Some(mut initial) = records::initial_write(owner, &write.record_id, provider).await?
        else {
            return Err(unexpected!("initial write not found"));
        };
        initial.encoded_data = None;
        Some(initial)
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(ReadReply {
            entry: ReadReplyEntry {
                records_write: Some(write),
                records_delete: None,
                initial_write,
                data,
            },
        }),
    })
}

/// The [`Read`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Read {
    /// The Read descriptor.
    pub descriptor: ReadDescriptor,

    /// The message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
}

impl Message for Read {
    type Reply = ReadReply;

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

/// [`ReadReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The read entry.
    pub entry: ReadReplyEntry,
}

/// The record (or tombstone) returned by a read.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The latest `RecordsWrite` of the record, when the record exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_write: Option<Write>,

    /// The `RecordsDelete` tombstone, when the record is deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records_delete: Option<Delete>,

    /// The record's initial write, when the returned message is not itself
    /// the initial write.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_write: Option<Write>,

    /// The record's payload.
    #[serde(skip)]
    pub data: Option<DataStream>,
}

impl Read {
    // Verify the fetched record can be returned to the viewer.
    async fn authorize(&self, owner: &str, write: &Write, provider: &impl Provider) -> Result<()> {
        // published records are readable by anyone
        if write.descriptor.published.unwrap_or_default() {
            return Ok(());
        }

        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("read of unpublished record requires authorization"));
        };
        authzn
            .verify(provider)
            .await
            .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;
        let author = authzn.author()?;

        // an author delegate reads within the delegated grant's scope; the
        // grant names the signer as grantee and the author as grantor
        if let Some(delegated) = &authzn.author_delegated_grant {
            let grant = delegated.to_grant()?;
            grant.verify_delegated(&author, &authzn.signer()?)?;
            grant.permit_read(owner, &authzn.signer()?, self, write, provider).await?;
        }

        // the owner reads anything in their own web node
        if author == owner {
            return Ok(());
        }

        // the record's recipient and author can always read it
        if write.descriptor.recipient.as_deref() == Some(author.as_str()) {
            return Ok(());
        }
        if author == write.authorization.author()? {
            return Ok(());
        }

        if let Some(grant_id) = &authzn.payload()?.permission_grant_id {
            let grant = permissions::fetch_grant(owner, grant_id, provider).await?;
            if grant.grantor != owner {
                return Err(forbidden!("grant not granted by web node owner"));
            }
            return grant.permit_read(owner, &author, self, write, provider).await;
        }

        if write.descriptor.protocol.is_some() {
            return protocol::permit_read(owner, self, write, provider).await;
        }

        Err(forbidden!("read cannot be authorized"))
    }
}

/// The [`Read`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The filter identifying the record to read.
    pub filter: RecordsFilter,
}

/// Builds a [`Read`] message.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    filter: RecordsFilter,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    anonymous: bool,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The filter identifying the record to read.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// The ID of the permission grant invoked to authorize the message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// The protocol role invoked to authorize the message.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical
    /// author.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Build the read without an authorization (published records only).
    #[must_use]
    pub const fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Generate and sign the Read message.
    ///
    /// # Errors
    ///
    /// Fails when the filter is invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let descriptor = ReadDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Read,
                message_timestamp: chrono::Utc::now(),
            },
            filter: self.filter.normalize()?,
        };

        let authorization = if self.anonymous {
            None
        } else {
            let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
            if let Some(id) = self.permission_grant_id {
                builder = builder.permission_grant_id(id);
            }
            if let Some(role) = self.protocol_role {
                builder = builder.protocol_role(role);
            }
            if let Some(delegated_grant) = self.delegated_grant {
                builder = builder.delegated_grant(delegated_grant);
            }
            Some(builder.build(signer).await?)
        };

        Ok(Read {
            descriptor,
            authorization,
        })
    }
}
