//! # Endpoint
//!
//! The endpoint dispatches incoming messages to their handler. Handlers for
//! a tenant are expected to be invoked serially (by the transport or an
//! explicit per-tenant lock); a handler's effects complete before it
//! returns.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::authorization::Authorization;
use crate::provider::Provider;
use crate::{Descriptor, Result, schema};

/// Handle an incoming message.
///
/// # Errors
///
/// Returns the handler's typed error when the message fails validation,
/// authentication, or authorization, or when a store operation fails.
pub async fn handle<T>(
    owner: &str, message: impl Message<Reply = T>, provider: &impl Provider,
) -> Result<Reply<T>> {
    message.validate()?;
    message.handle(owner, provider).await
}

/// Methods common to all messages.
pub trait Message: Serialize + Clone + Debug + Send + Sync {
    /// The message's inner reply type.
    type Reply;

    /// Compute the content identifier (CID) of the message.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be serialized to CBOR.
    fn cid(&self) -> Result<String>;

    /// The component of the message descriptor common to all messages.
    fn descriptor(&self) -> &Descriptor;

    /// The message's authorization, if set.
    fn authorization(&self) -> Option<&Authorization>;

    /// Handle the message.
    fn handle(
        self, owner: &str, provider: &impl Provider,
    ) -> impl Future<Output = Result<Reply<Self::Reply>>> + Send;

    /// Validate the message envelope. Message-specific validation is done in
    /// the message handler.
    ///
    /// # Errors
    ///
    /// Fails with `Error::BadRequest` when the envelope is malformed.
    fn validate(&self) -> Result<()> {
        schema::validate(self)
    }
}

/// Reply used by all endpoints.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Reply<T> {
    /// Status message to accompany the reply.
    pub status: Status,

    /// Endpoint-specific reply.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(flatten)]
    pub body: Option<T>,
}

/// Reply status.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    /// Status code.
    pub code: u16,

    /// Status detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
