//! # Authorization
//!
//! The `authorization` property of a message carries up to four JWS
//! envelopes: the message signature, an optional owner signature (the
//! tenant attesting retention of an externally authored message), and
//! optional author/owner delegated grants that let the signer act *as*
//! another entity.

use serde::{Deserialize, Serialize};

use crate::jws::{Jws, JwsBuilder};
use crate::provider::{DidResolver, Signer};
use crate::records::DelegatedGrant;
use crate::{Result, forbidden, unexpected, utils};

/// Message authorization.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    /// The message signature.
    pub signature: Jws,

    /// The signature of the web node owner, attesting the retention of an
    /// externally authored message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_signature: Option<Jws>,

    /// The delegated grant invoked by the signer to author the message on
    /// behalf of the grantor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_delegated_grant: Option<DelegatedGrant>,

    /// The delegated grant invoked by the signer to act on behalf of the
    /// web node owner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_delegated_grant: Option<DelegatedGrant>,
}

/// The payload common to message signatures.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JwsPayload {
    /// The CID of the message descriptor the signature covers.
    pub descriptor_cid: String,

    /// The ID of the permission grant invoked to authorize the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_grant_id: Option<String>,

    /// The CID of the delegated grant invoked to author the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated_grant_id: Option<String>,

    /// The protocol role invoked to authorize the message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_role: Option<String>,
}

impl Authorization {
    /// The logical author of the message: the grantor of the author
    /// delegated grant when one is invoked, the signer otherwise.
    ///
    /// # Errors
    ///
    /// Fails when a signer DID cannot be extracted.
    pub fn author(&self) -> Result<String> {
        self.author_delegated_grant.as_ref().map_or_else(
            || self.signature.did(),
            |grant| grant.authorization.signature.did(),
        )
    }

    /// The entity that signed the message.
    ///
    /// # Errors
    ///
    /// Fails when the signer DID cannot be extracted.
    pub fn signer(&self) -> Result<String> {
        self.signature.did()
    }

    /// The owner of the message, when an owner signature (or owner delegated
    /// grant) is present.
    ///
    /// # Errors
    ///
    /// Fails when a signer DID cannot be extracted.
    pub fn owner(&self) -> Result<Option<String>> {
        if let Some(grant) = &self.owner_delegated_grant {
            return Ok(Some(grant.authorization.signature.did()?));
        }
        let Some(owner_signature) = &self.owner_signature else {
            return Ok(None);
        };
        Ok(Some(owner_signature.did()?))
    }

    /// The entity that signed the owner signature.
    ///
    /// # Errors
    ///
    /// Fails when no owner signature is present.
    pub fn owner_signer(&self) -> Result<String> {
        let Some(owner_signature) = &self.owner_signature else {
            return Err(unexpected!("no owner signature found"));
        };
        owner_signature.did()
    }

    /// The base payload of the message signature.
    ///
    /// # Errors
    ///
    /// Fails when the payload cannot be deserialized.
    pub fn payload(&self) -> Result<JwsPayload> {
        self.signature.payload()
    }

    /// Authenticate the message: verify every JWS present and the internal
    /// consistency of any invoked delegated grants.
    ///
    /// # Errors
    ///
    /// Fails with an authentication error when a signature does not verify
    /// or a delegated grant reference is inconsistent.
    pub async fn verify(&self, resolver: &impl DidResolver) -> Result<()> {
        self.signature.verify(resolver).await?;

        if let Some(owner_signature) = &self.owner_signature {
            owner_signature.verify(resolver).await?;
        }

        if let Some(grant) = &self.author_delegated_grant {
            grant.authorization.signature.verify(resolver).await?;

            // the signature payload must reference the attached grant
            let payload: JwsPayload = self.signature.payload()?;
            if payload.delegated_grant_id.as_deref() != Some(grant.cid()?.as_str()) {
                return Err(forbidden!("message does not reference the author delegated grant"));
            }
        }

        if let Some(grant) = &self.owner_delegated_grant {
            grant.authorization.signature.verify(resolver).await?;

            let Some(owner_signature) = &self.owner_signature else {
                return Err(forbidden!("owner delegated grant present without owner signature"));
            };
            let payload: JwsPayload = owner_signature.payload()?;
            if payload.delegated_grant_id.as_deref() != Some(grant.cid()?.as_str()) {
                return Err(forbidden!("message does not reference the owner delegated grant"));
            }
        }

        Ok(())
    }
}

/// Builds an [`Authorization`] for a message descriptor.
#[derive(Clone, Debug, Default)]
pub struct AuthorizationBuilder {
    descriptor_cid: Option<String>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
    protocol_role: Option<String>,
}

impl AuthorizationBuilder {
    /// Returns a new [`AuthorizationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the CID of the descriptor being signed.
    #[must_use]
    pub fn descriptor_cid(mut self, descriptor_cid: impl Into<String>) -> Self {
        self.descriptor_cid = Some(descriptor_cid.into());
        self
    }

    /// Set the descriptor being signed, computing its CID.
    ///
    /// # Errors
    ///
    /// Fails when the descriptor cannot be serialized.
    pub fn descriptor<T: Serialize>(mut self, descriptor: &T) -> Result<Self> {
        self.descriptor_cid = Some(utils::cid::from_value(descriptor)?);
        Ok(self)
    }

    /// The delegated grant invoked to sign on behalf of the logical author,
    /// who is the grantor of the delegated grant.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
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

    /// Sign the payload and generate the [`Authorization`].
    ///
    /// # Errors
    ///
    /// Fails when no descriptor CID is set or the signer fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Authorization> {
        let Some(descriptor_cid) = self.descriptor_cid else {
            return Err(unexpected!("descriptor CID not set"));
        };

        let delegated_grant_id =
            self.delegated_grant.as_ref().map(DelegatedGrant::cid).transpose()?;

        let payload = JwsPayload {
            descriptor_cid,
            permission_grant_id: self.permission_grant_id,
            delegated_grant_id,
            protocol_role: self.protocol_role,
        };
        let signature = JwsBuilder::new(payload).build(signer).await?;

        Ok(Authorization {
            signature,
            owner_signature: None,
            author_delegated_grant: self.delegated_grant,
            owner_delegated_grant: None,
        })
    }
}
