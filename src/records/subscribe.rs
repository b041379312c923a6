//! # Records Subscribe
//!
//! The records subscribe endpoint handles `RecordsSubscribe` messages —
//! requests for a live stream of record events matching a filter. The
//! installed filters encode the viewer's authority, exactly as for
//! queries. When the subscription was authorized by a protocol role, the
//! stream re-evaluates that authority per the subscription's
//! re-authorization TTL and closes on failure.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::event::{Event, SubscribeFilter, Subscriber};
use crate::provider::{EventStream, MessageStore, Provider, Signer};
use crate::records::{RecordsFilter, protocol};
use crate::store::RecordsQueryBuilder;
use crate::{Descriptor, Error, Interface, Method, Result, forbidden, utils};

/// Handle — or process — a [`Subscribe`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when the provider does not support event streaming.
pub async fn handle(
    owner: &str, subscribe: Subscribe, provider: &impl Provider,
) -> Result<Reply<SubscribeReply>> {
    let filters = if subscribe.authorization.is_none()
        || subscribe.descriptor.filter.published == Some(true)
    {
        // anonymous subscriptions observe published records only
        vec![subscribe.descriptor.filter.clone().published(true)]
    } else {
        subscribe.authorize(owner, provider).await?;
        let Some(authzn) = &subscribe.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        let author = authzn.author()?;

        if author == owner {
            vec![subscribe.descriptor.filter.clone()]
        } else {
            let base = &subscribe.descriptor.filter;
            let mut filters = Vec::new();
            if base.published.is_none() {
                filters.push(base.clone().published(true));
            }
            let mut authored = base.clone();
            authored.author = None;
            filters.push(authored.add_author(&author).published(false));
            let mut addressed = base.clone();
            addressed.recipient = None;
            filters.push(addressed.add_recipient(&author).published(false));
            if authzn.payload()?.protocol_role.is_some() {
                filters.push(base.clone().published(false));
            }
            filters
        }
    };

    let subscriber = EventStream::subscribe(provider, owner, SubscribeFilter::Records(filters))
        .await
        .map_err(|e| Error::Unsupported(format!("event stream unavailable: {e}")))?;

    // a role-authorized subscription is guarded against losing the role
    let subscriber = match subscribe.invoked_role_record(owner, provider).await? {
        Some(role_record_id) => RoleGuard::wrap(
            subscriber,
            role_record_id,
            subscribe.descriptor.reauthorization_ttl.unwrap_or_default(),
        ),
        None => subscriber,
    };

    Ok(Reply {
        status: Status {
            code: StatusCode::OK.as_u16(),
            detail: None,
        },
        body: Some(SubscribeReply {
            subscription: subscriber,
        }),
    })
}

/// The [`Subscribe`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscribe {
    /// The Subscribe descriptor.
    pub descriptor: SubscribeDescriptor,

    /// The message authorization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization: Option<Authorization>,
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
        self.authorization.as_ref()
    }

    async fn handle(self, owner: &str, provider: &impl Provider) -> Result<Reply<Self::Reply>> {
        handle(owner, self, provider).await
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

    /// The filter events must match.
    pub filter: RecordsFilter,

    /// Seconds between re-evaluations of a role-based authorization: `0`
    /// never re-authorizes, a negative value re-authorizes on every
    /// matching event, a positive value after that many seconds since the
    /// last check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reauthorization_ttl: Option<i64>,
}

impl Subscribe {
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let Some(authzn) = &self.authorization else {
            return Err(forbidden!("missing authorization"));
        };
        authzn
            .verify(provider)
            .await
            .map_err(|e| Error::Unauthorized(format!("failed to authenticate: {e}")))?;

        if authzn.author()? == owner {
            return Ok(());
        }

        // a subscription invoking a protocol role must hold the role
        if authzn.payload()?.protocol_role.is_some() {
            protocol::permit_subscribe(owner, self, provider).await?;
        }

        Ok(())
    }

    // When a protocol role is invoked, find the role record that granted
    // it so the subscription can watch for its loss.
    async fn invoked_role_record(
        &self, owner: &str, provider: &impl Provider,
    ) -> Result<Option<String>> {
        let Some(authzn) = &self.authorization else {
            return Ok(None);
        };
        let Some(role) = authzn.payload()?.protocol_role else {
            return Ok(None);
        };
        let author = authzn.author()?;

        let filter = RecordsFilter::new()
            .protocol(self.descriptor.filter.protocol.clone().unwrap_or_default())
            .protocol_path(role)
            .add_recipient(author);
        let query = RecordsQueryBuilder::new().add_filter(filter).build();
        let (entries, _) = MessageStore::query(provider, owner, &query).await?;

        let Some(entry) = entries.first() else {
            return Ok(None);
        };
        Ok(entry.as_write().map(|write| write.record_id.clone()))
    }
}

// Guards a role-authorized subscription: when the authorizing role record
// is updated or deleted, the subscription is closed per the TTL policy.
struct RoleGuard {
    inner: Subscriber,
    role_record_id: String,
    ttl: i64,
    last_check: Instant,
    role_lost: bool,
}

impl RoleGuard {
    fn wrap(inner: Subscriber, role_record_id: String, ttl: i64) -> Subscriber {
        let guard = Self {
            inner,
            role_record_id,
            ttl,
            last_check: Instant::now(),
            role_lost: false,
        };
        Subscriber::new(Box::pin(guard))
    }

    fn should_close(&mut self, event: &Event) -> bool {
        // ttl == 0: never re-authorize
        if self.ttl == 0 {
            return false;
        }

        if event.indexes.get("recordId")
            == Some(&Value::String(self.role_record_id.clone()))
        {
            self.role_lost = true;
        }
        if !self.role_lost {
            return false;
        }

        // ttl < 0: re-authorize on every matching event
        if self.ttl < 0 {
            return true;
        }
        // ttl > 0: re-authorize once the interval has elapsed
        if self.last_check.elapsed().as_secs() >= self.ttl.unsigned_abs() {
            self.last_check = Instant::now();
            return true;
        }
        false
    }
}

impl Stream for RoleGuard {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(event)) => {
                if self.should_close(&event) {
                    // losing the role is a terminal subscription state
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(event))
                }
            }
            other => other,
        }
    }
}

/// Builds a [`Subscribe`] message.
#[derive(Clone, Debug, Default)]
pub struct SubscribeBuilder {
    filter: RecordsFilter,
    reauthorization_ttl: Option<i64>,
    protocol_role: Option<String>,
    anonymous: bool,
}

impl SubscribeBuilder {
    /// Returns a new [`SubscribeBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The filter events must match.
    #[must_use]
    pub fn filter(mut self, filter: RecordsFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Seconds between role re-authorization checks.
    #[must_use]
    pub const fn reauthorization_ttl(mut self, reauthorization_ttl: i64) -> Self {
        self.reauthorization_ttl = Some(reauthorization_ttl);
        self
    }

    /// The protocol role invoked to authorize the message.
    #[must_use]
    pub fn protocol_role(mut self, protocol_role: impl Into<String>) -> Self {
        self.protocol_role = Some(protocol_role.into());
        self
    }

    /// Build the subscription without an authorization (published records
    /// only).
    #[must_use]
    pub const fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    /// Generate and sign the Subscribe message.
    ///
    /// # Errors
    ///
    /// Fails when the filter is invalid or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Subscribe> {
        let descriptor = SubscribeDescriptor {
            base: Descriptor {
                interface: Interface::Records,
                method: Method::Subscribe,
                message_timestamp: chrono::Utc::now(),
            },
            filter: self.filter.normalize()?,
            reauthorization_ttl: self.reauthorization_ttl,
        };

        let authorization = if self.anonymous {
            None
        } else {
            let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
            if let Some(role) = self.protocol_role {
                builder = builder.protocol_role(role);
            }
            Some(builder.build(signer).await?)
        };

        Ok(Subscribe {
            descriptor,
            authorization,
        })
    }
}
