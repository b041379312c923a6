//! # Grant
//!
//! Issuing and validating permission grants. A grant is a `RecordsWrite`
//! under the reserved permissions protocol whose payload declares the
//! grantee, expiry, scope, and conditions; a revocation is a child record
//! of the grant it revokes.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};

use super::{ConditionPublication, Conditions, Scope};
use crate::provider::{MessageStore, Signer};
use crate::records::{
    Data, DelegatedGrant, Delete, Read, RecordsFilter, Write, WriteBuilder, WriteProtocol,
};
use crate::store::RecordsQueryBuilder;
use crate::{Descriptor, Interface, Result, forbidden, protocols, utils};

/// A permission grant, unpacked from its `RecordsWrite` record.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Grant {
    /// The ID of the grant record.
    pub id: String,

    /// The entity that issued the grant.
    pub grantor: String,

    /// The entity the grant was issued to.
    pub grantee: String,

    /// The datetime the grant was issued.
    pub date_granted: DateTime<Utc>,

    /// The grant's payload.
    pub data: GrantData,
}

/// The payload of a permission grant record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GrantData {
    /// The datetime the grant expires.
    #[serde(with = "utils::rfc3339_micros")]
    pub date_expires: DateTime<Utc>,

    /// The ID of the permission request the grant responds to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    /// A description of the grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether the grant lets the grantee act *as* the grantor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated: Option<bool>,

    /// The scope of the grant.
    pub scope: Scope,

    /// Conditions that must be met when the grant is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

/// The payload of a permission request record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    /// A description of the request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Whether a delegated grant is requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegated: Option<bool>,

    /// The requested scope.
    pub scope: Scope,

    /// The requested conditions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Conditions>,
}

/// The payload of a permission revocation record.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RevocationData {
    /// A description of the revocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TryFrom<&Write> for Grant {
    type Error = crate::Error;

    fn try_from(write: &Write) -> Result<Self> {
        let Some(encoded) = &write.encoded_data else {
            return Err(forbidden!("missing grant data"));
        };
        let bytes = Base64UrlUnpadded::decode_vec(encoded)?;
        let data: GrantData = serde_json::from_slice(&bytes)
            .map_err(|e| forbidden!("invalid grant data: {e}"))?;

        Ok(Self {
            id: write.record_id.clone(),
            grantor: write.authorization.signer()?,
            grantee: write.descriptor.recipient.clone().unwrap_or_default(),
            date_granted: write.descriptor.date_created,
            data,
        })
    }
}

impl TryFrom<&DelegatedGrant> for Grant {
    type Error = crate::Error;

    fn try_from(delegated: &DelegatedGrant) -> Result<Self> {
        let bytes = Base64UrlUnpadded::decode_vec(&delegated.encoded_data)?;
        let data: GrantData = serde_json::from_slice(&bytes)
            .map_err(|e| forbidden!("invalid grant data: {e}"))?;

        Ok(Self {
            id: delegated.record_id.clone(),
            grantor: delegated.authorization.signature.did()?,
            grantee: delegated.descriptor.recipient.clone().unwrap_or_default(),
            date_granted: delegated.descriptor.date_created,
            data,
        })
    }
}

impl Grant {
    /// Verify the grant covers a message: the interface and method match
    /// the grant's scope and the grant was active (issued, unexpired,
    /// unrevoked) at the message's timestamp.
    ///
    /// # Errors
    ///
    /// Fails with an authorization error when any check fails.
    pub async fn verify(
        &self, owner: &str, descriptor: &Descriptor, store: &impl MessageStore,
    ) -> Result<()> {
        self.data.scope.validate()?;

        if self.data.scope.interface() != descriptor.interface {
            return Err(forbidden!("interface is not within grant scope"));
        }
        if self.data.scope.method() != descriptor.method {
            return Err(forbidden!("method is not within grant scope"));
        }

        self.verify_active(owner, descriptor.message_timestamp, store).await
    }

    /// Verify the grant supports delegation and was issued by the claimed
    /// author to the message signer.
    ///
    /// # Errors
    ///
    /// Fails with an authorization error when any check fails.
    pub fn verify_delegated(&self, author: &str, signer: &str) -> Result<()> {
        if !self.data.delegated.unwrap_or_default() {
            return Err(forbidden!("grant is not delegated"));
        }
        if self.grantor != author {
            return Err(forbidden!("grantor does not match logical author"));
        }
        if self.grantee != signer {
            return Err(forbidden!("grant not granted to signer"));
        }
        Ok(())
    }

    /// Verify a `Protocols` or `Messages` scope against the target
    /// protocol.
    ///
    /// # Errors
    ///
    /// Fails when the scope narrows to a different protocol.
    pub fn verify_protocol_scope(
        &self, interface: Interface, protocol: Option<&str>,
    ) -> Result<()> {
        if self.data.scope.interface() != interface {
            return Err(forbidden!("interface is not within grant scope"));
        }
        let Some(scoped) = self.data.scope.protocol() else {
            return Ok(());
        };
        if protocol != Some(scoped) {
            return Err(forbidden!("protocol is not within grant scope"));
        }
        Ok(())
    }

    /// Authorize a `RecordsWrite` for the grantee.
    ///
    /// # Errors
    ///
    /// Fails with an authorization error when any check fails.
    pub(crate) async fn permit_write(
        &self, owner: &str, author: &str, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        if self.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        self.verify(owner, &write.descriptor.base, store).await?;
        self.verify_records_scope(write)?;
        self.verify_conditions(write)
    }

    /// Authorize a `RecordsDelete` for the grantee. The scope is evaluated
    /// against the initial write of the record being deleted.
    ///
    /// # Errors
    ///
    /// Fails with an authorization error when any check fails.
    pub(crate) async fn permit_delete(
        &self, owner: &str, author: &str, delete: &Delete, initial_write: &Write,
        store: &impl MessageStore,
    ) -> Result<()> {
        if self.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        self.verify(owner, &delete.descriptor.base, store).await?;
        self.verify_records_scope(initial_write)
    }

    /// Authorize a `RecordsRead` for the grantee against the record being
    /// read.
    ///
    /// # Errors
    ///
    /// Fails with an authorization error when any check fails.
    pub(crate) async fn permit_read(
        &self, owner: &str, author: &str, read: &Read, write: &Write, store: &impl MessageStore,
    ) -> Result<()> {
        if self.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        self.verify(owner, &read.descriptor.base, store).await?;
        self.verify_records_scope(write)
    }

    /// Authorize a records query or subscribe for the grantee by checking
    /// the filter stays within the grant's scope.
    ///
    /// # Errors
    ///
    /// Fails with an authorization error when any check fails.
    pub(crate) async fn permit_query(
        &self, owner: &str, author: &str, descriptor: &Descriptor, filter: &RecordsFilter,
        store: &impl MessageStore,
    ) -> Result<()> {
        if self.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        self.verify(owner, descriptor, store).await?;

        let Scope::Records {
            protocol, schema, ..
        } = &self.data.scope
        else {
            return Err(forbidden!("grant scope does not apply to records"));
        };
        if let Some(protocol) = protocol {
            if filter.protocol.as_deref() != Some(protocol) {
                return Err(forbidden!("filter and grant protocols do not match"));
            }
        }
        if let Some(schema) = schema {
            if filter.schema.as_deref() != Some(schema) {
                return Err(forbidden!("filter and grant schemas do not match"));
            }
        }
        Ok(())
    }

    /// Verify a `Records` scope against the record the action targets.
    ///
    /// # Errors
    ///
    /// Fails when the record falls outside the scope.
    pub(crate) fn verify_records_scope(&self, write: &Write) -> Result<()> {
        let Scope::Records {
            protocol,
            schema,
            options,
            ..
        } = &self.data.scope
        else {
            return Err(forbidden!("grant scope does not apply to records"));
        };

        if let Some(protocol) = protocol {
            if write.descriptor.protocol.as_deref() != Some(protocol) {
                return Err(forbidden!("record protocol is not within grant scope"));
            }
            match options {
                Some(super::RecordsOptions::ContextId(context_id)) => {
                    let Some(record_context) = &write.context_id else {
                        return Err(forbidden!("record context is not within grant scope"));
                    };
                    if record_context != context_id
                        && !record_context.starts_with(&format!("{context_id}/"))
                    {
                        return Err(forbidden!("record context is not within grant scope"));
                    }
                }
                Some(super::RecordsOptions::ProtocolPath(protocol_path)) => {
                    if write.descriptor.protocol_path.as_deref() != Some(protocol_path) {
                        return Err(forbidden!("record protocol path is not within grant scope"));
                    }
                }
                None => {}
            }
        }
        if let Some(schema) = schema {
            if write.descriptor.schema.as_deref() != Some(schema) {
                return Err(forbidden!("record schema is not within grant scope"));
            }
        }

        Ok(())
    }

    // Verify the grant's conditions are met by the message.
    fn verify_conditions(&self, write: &Write) -> Result<()> {
        let Some(conditions) = self.data.conditions.as_ref() else {
            return Ok(());
        };
        let published = write.descriptor.published.unwrap_or_default();
        match conditions.publication {
            Some(ConditionPublication::Required) if !published => {
                Err(forbidden!("grant requires message to be published"))
            }
            Some(ConditionPublication::Prohibited) if published => {
                Err(forbidden!("grant prohibits publishing message"))
            }
            _ => Ok(()),
        }
    }

    // Verify the grant was active (issued, unexpired, unrevoked) at the
    // given timestamp.
    async fn verify_active(
        &self, owner: &str, timestamp: DateTime<Utc>, store: &impl MessageStore,
    ) -> Result<()> {
        if timestamp < self.date_granted {
            return Err(forbidden!("grant is not yet active"));
        }
        if timestamp >= self.data.date_expires {
            return Err(forbidden!("grant has expired"));
        }

        // look for a revocation child of the grant effective at `timestamp`
        let query = RecordsQueryBuilder::new()
            .add_filter(
                RecordsFilter::new()
                    .protocol(protocols::PROTOCOL_URI)
                    .protocol_path(protocols::REVOCATION_PATH)
                    .parent_id(&self.id),
            )
            .build();
        let (entries, _) = store.query(owner, &query).await?;

        for entry in entries {
            if entry.descriptor().message_timestamp <= timestamp {
                return Err(forbidden!("grant has been revoked"));
            }
        }

        Ok(())
    }
}

/// Builds the `RecordsWrite` for a permission grant.
#[derive(Clone, Debug, Default)]
pub struct GrantBuilder {
    granted_to: Option<String>,
    date_expires: Option<DateTime<Utc>>,
    request_id: Option<String>,
    description: Option<String>,
    delegated: Option<bool>,
    scope: Option<Scope>,
    conditions: Option<Conditions>,
}

impl GrantBuilder {
    /// Returns a new [`GrantBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The entity the grant is issued to.
    #[must_use]
    pub fn granted_to(mut self, granted_to: impl Into<String>) -> Self {
        self.granted_to = Some(granted_to.into());
        self
    }

    /// The datetime the grant expires. Defaults to 100 days from now.
    #[must_use]
    pub const fn date_expires(mut self, date_expires: DateTime<Utc>) -> Self {
        self.date_expires = Some(date_expires);
        self
    }

    /// The ID of the permission request the grant responds to.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// A description of the grant.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Issue the grant as a delegated grant.
    #[must_use]
    pub const fn delegated(mut self, delegated: bool) -> Self {
        self.delegated = Some(delegated);
        self
    }

    /// The scope of the grant.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Conditions that must be met when the grant is used.
    #[must_use]
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Generate and sign the grant record.
    ///
    /// # Errors
    ///
    /// Fails when required properties are unset or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let Some(granted_to) = self.granted_to else {
            return Err(forbidden!("grant has no grantee"));
        };
        let Some(scope) = self.scope else {
            return Err(forbidden!("grant has no scope"));
        };
        scope.validate()?;

        let grant_data = GrantData {
            date_expires: self
                .date_expires
                .unwrap_or_else(|| Utc::now() + Days::new(100)),
            request_id: self.request_id,
            description: self.description,
            delegated: self.delegated,
            scope,
            conditions: self.conditions,
        };
        let data = serde_json::to_vec(&grant_data)?;

        WriteBuilder::new()
            .recipient(granted_to)
            .protocol(WriteProtocol {
                protocol: protocols::PROTOCOL_URI.to_string(),
                protocol_path: protocols::GRANT_PATH.to_string(),
            })
            .schema(format!("{}/schemas/grant", protocols::PROTOCOL_URI))
            .data_format("application/json")
            .data(Data::from(data))
            .build(signer)
            .await
    }
}

/// Builds the `RecordsWrite` for a permission request.
#[derive(Clone, Debug, Default)]
pub struct RequestBuilder {
    description: Option<String>,
    delegated: Option<bool>,
    scope: Option<Scope>,
    conditions: Option<Conditions>,
}

impl RequestBuilder {
    /// Returns a new [`RequestBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A description of the request.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Request a delegated grant.
    #[must_use]
    pub const fn delegated(mut self, delegated: bool) -> Self {
        self.delegated = Some(delegated);
        self
    }

    /// The requested scope.
    #[must_use]
    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// The requested conditions.
    #[must_use]
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = Some(conditions);
        self
    }

    /// Generate and sign the request record.
    ///
    /// # Errors
    ///
    /// Fails when required properties are unset or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let Some(scope) = self.scope else {
            return Err(forbidden!("request has no scope"));
        };
        scope.validate()?;

        let request_data = RequestData {
            description: self.description,
            delegated: self.delegated,
            scope,
            conditions: self.conditions,
        };
        let data = serde_json::to_vec(&request_data)?;

        WriteBuilder::new()
            .protocol(WriteProtocol {
                protocol: protocols::PROTOCOL_URI.to_string(),
                protocol_path: protocols::REQUEST_PATH.to_string(),
            })
            .schema(format!("{}/schemas/request", protocols::PROTOCOL_URI))
            .data_format("application/json")
            .data(Data::from(data))
            .build(signer)
            .await
    }
}

/// Builds the `RecordsWrite` revoking a permission grant.
#[derive(Clone, Debug, Default)]
pub struct RevocationBuilder {
    grant: Option<Write>,
    description: Option<String>,
}

impl RevocationBuilder {
    /// Returns a new [`RevocationBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The grant record to revoke.
    #[must_use]
    pub fn grant(mut self, grant: Write) -> Self {
        self.grant = Some(grant);
        self
    }

    /// A description of the revocation.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Generate and sign the revocation record.
    ///
    /// # Errors
    ///
    /// Fails when no grant is set or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Write> {
        let Some(grant) = self.grant else {
            return Err(forbidden!("no grant to revoke"));
        };
        let Some(context_id) = grant.context_id.clone() else {
            return Err(forbidden!("grant record has no context"));
        };

        let revocation_data = RevocationData {
            description: self.description,
        };
        let data = serde_json::to_vec(&revocation_data)?;

        WriteBuilder::new()
            .protocol(WriteProtocol {
                protocol: protocols::PROTOCOL_URI.to_string(),
                protocol_path: protocols::REVOCATION_PATH.to_string(),
            })
            .schema(format!("{}/schemas/revocation", protocols::PROTOCOL_URI))
            .parent_context_id(context_id)
            .data_format("application/json")
            .data(Data::from(data))
            .build(signer)
            .await
    }
}
