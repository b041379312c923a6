//! # Messages Read
//!
//! The messages read endpoint handles `MessagesRead` messages — requests
//! to fetch a single persisted message (of any type) by its CID, along
//! with its payload for `RecordsWrite` messages.

use std::str::FromStr;

use base64ct::{Base64UrlUnpadded, Encoding};
use cid::Cid;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::data::DataStream;
use crate::endpoint::{Message, Reply, Status};
use crate::permissions::{self, Scope};
use crate::provider::{MessageStore, Provider, Signer};
use crate::store::{Entry, EntryType};
use crate::{
    Descriptor, Error, Interface, Method, Result, forbidden, invalid, protocols, records, utils,
};

/// Handle — or process — a [`Read`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs fetching the message.
pub async fn handle(owner: &str, read: Read, provider: &impl Provider) -> Result<Reply<ReadReply>> {
    // the message CID must be well-formed
    let cid = Cid::from_str(&read.descriptor.message_cid)
        .map_err(|e| invalid!("invalid message CID: {e}"))?;

    let Some(entry) = MessageStore::get(provider, owner, &cid.to_string()).await? else {
        return Err(Error::NotFound("message not found".to_string()));
    };

    // verify the fetched message can be returned to the viewer
    read.authorize(owner, &entry, provider).await?;

    let mut message = entry.message;

    // include payload data with `RecordsWrite` messages
    let data = if let EntryType::Write(write) = &mut message {
        if let Some(encoded) = write.encoded_data.take() {
            Some(DataStream::from(Base64UrlUnpadded::decode_vec(&encoded)?))
        } else {
            DataStream::from_store(owner, &write.record_id, &write.descriptor.data_cid, provider)
                .await?
        }
    } else {
        None
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(ReadReply {
            entry: Some(ReadReplyEntry {
                message_cid: read.descriptor.message_cid,
                message,
                data,
            }),
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
    pub authorization: Authorization,
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
        Some(&self.authorization)
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
    }
}

impl Read {
    async fn authorize(&self, owner: &str, entry: &Entry, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        authzn
            .verify(provider)
            .await
            .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;

        let author = authzn.author()?;
        if author == owner {
            return Ok(());
        }

        let Some(grant_id) = authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("missing grant ID"));
        };
        let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
        if grant.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        if grant.grantor != owner {
            return Err(forbidden!("grant not granted by web node owner"));
        }
        grant.verify(owner, self.descriptor(), provider).await?;
        verify_scope(owner, entry, &grant.data.scope, provider).await
    }
}

// Verify the target message falls within the grant's protocol scope.
async fn verify_scope(
    owner: &str, requested: &Entry, scope: &Scope, store: &impl MessageStore,
) -> Result<()> {
    // an unscoped grant covers every message
    let Some(protocol) = scope.protocol() else {
        return Ok(());
    };

    match &requested.message {
        EntryType::Configure(configure) => {
            if configure.descriptor.definition.protocol == protocol {
                return Ok(());
            }
        }
        EntryType::Write(write) => {
            if write.descriptor.protocol.as_deref() == Some(protocol) {
                return Ok(());
            }
            // a permission record is in scope when the permission it
            // carries is for the scoped protocol
            if write.descriptor.protocol.as_deref() == Some(protocols::PROTOCOL_URI) {
                let permission_scope = permissions::fetch_scope(owner, write, store).await?;
                if permission_scope.protocol() == Some(protocol) {
                    return Ok(());
                }
            }
        }
        EntryType::Delete(delete) => {
            let Some(write) =
                records::initial_write(owner, &delete.descriptor.record_id, store).await?
            else {
                return Err(forbidden!("message failed scope authorization"));
            };
            if write.descriptor.protocol.as_deref() == Some(protocol) {
                return Ok(());
            }
        }
    }

    Err(forbidden!("message failed scope authorization"))
}

/// [`ReadReply`] is returned by the handler in the [`Reply`] `body` field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReply {
    /// The fetched message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<ReadReplyEntry>,
}

/// The message returned by a read.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReplyEntry {
    /// The CID of the fetched message.
    pub message_cid: String,

    /// The fetched message.
    pub message: EntryType,

    /// The payload of a `RecordsWrite` message.
    #[serde(skip)]
    pub data: Option<DataStream>,
}

/// The [`Read`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The CID of the message to read.
    pub message_cid: String,
}

/// Builds a [`Read`] message.
#[derive(Clone, Debug, Default)]
pub struct ReadBuilder {
    message_cid: Option<String>,
    permission_grant_id: Option<String>,
}

impl ReadBuilder {
    /// Returns a new [`ReadBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The CID of the message to read.
    #[must_use]
    pub fn message_cid(mut self, message_cid: impl Into<String>) -> Self {
        self.message_cid = Some(message_cid.into());
        self
    }

    /// The ID of the permission grant invoked to authorize the message.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Generate and sign the Read message.
    ///
    /// # Errors
    ///
    /// Fails when no message CID is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Read> {
        let Some(message_cid) = self.message_cid else {
            return Err(invalid!("message CID not set"));
        };

        let descriptor = ReadDescriptor {
            base: Descriptor {
                interface: Interface::Messages,
                method: Method::Read,
                message_timestamp: chrono::Utc::now(),
            },
            message_cid,
        };

        let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Read {
            descriptor,
            authorization,
        })
    }
}
