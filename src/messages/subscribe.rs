//! # Messages Subscribe
//!
//! The messages subscribe endpoint handles `MessagesSubscribe` messages —
//! requests for a live stream of every message event on the web node,
//! optionally filtered.

use http::StatusCode;
use serde::{Deserialize, Serialize};

use super::MessagesFilter;
use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::event::{SubscribeFilter, Subscriber};
use crate::provider::{EventStream, Provider, Signer};
use crate::{Descriptor, Error, Interface, Method, Result, forbidden, permissions, utils};

/// Handle — or process — a [`Subscribe`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when the provider does not support event streaming.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    subscribe.authorize(owner, provider).await?;

    let filter = SubscribeFilter::Messages(subscribe.descriptor.filters.clone());
    let subscription = EventStream::subscribe(provider, owner, filter)
        .await
        .map_err(|e| Error::Unsupported(format!("event stream unavailable: {e}")))?;

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(SubscribeReply { subscription }),
    })
}

/// The [`Subscribe`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Subscribe {
    type Reply = SubscribeReply;

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

impl Subscribe {
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

/// [`SubscribeReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Debug, Default)]
pub struct SubscribeReply {
    /// The open subscription.
    pub subscription: Subscriber,
}

/// The [`Subscribe`] message descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// Filters events must match. An event matches when any filter
    /// matches; no filters matches everything.
    #[serde(default)]
    pub filters: Vec<MessagesFilter>,
}

/// Builds a [`Subscribe`] message.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filters: Vec<MessagesFilter>,
    permission_grant_id: Option<String>,
}

impl SubscribeBuilder {
    /// Returns a new [`SubscribeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter to the subscription.
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

    /// Generate and sign the Subscribe message.
    ///
    /// # Errors
    ///
    /// Fails when signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Messages,
                method: Method::Subscribe,
                message_timestamp: chrono::Utc::now(),
            },
            filters: self.filters,
        };

        let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        let authorization = builder.build(signer).await?;

        Ok(Subscribe {
            descriptor,
            authorization,
        })
    }
}
