//! # Schema
//!
//! Generic validation of message envelopes, common to all messages.
//! Full JSON-schema validation of wire envelopes is the transport's
//! concern; the checks here guard the invariants the handlers rely on.

use crate::endpoint::Message;
use crate::{Interface, Method, Result, invalid};

/// Validate a message envelope.
///
/// # Errors
///
/// Fails with `Error::BadRequest` when the envelope is malformed.
pub(crate) fn validate(message: &impl Message) -> Result<()> {
    let descriptor = message.descriptor();

    let supported = matches!(
        (&descriptor.interface, &descriptor.method),
        (
            Interface::Records,
            Method::Write | Method::Delete | Method::Read | Method::Query | Method::Subscribe
        ) | (Interface::Protocols, Method::Configure | Method::Query)
            | (Interface::Messages, Method::Read | Method::Query | Method::Subscribe)
    );
    if !supported {
        return Err(invalid!(
            "unsupported method {method} for interface {interface}",
            method = descriptor.method,
            interface = descriptor.interface
        ));
    }

    // an authorization, when present, must carry a signature
    if let Some(authzn) = message.authorization() {
        if authzn.signature.signatures.is_empty() {
            return Err(invalid!("authorization has no signatures"));
        }
    }

    Ok(())
}
