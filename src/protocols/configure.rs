//! # Protocols Configure
//!
//! The configure endpoint handles `ProtocolsConfigure` messages — requests
//! to install (or replace) a protocol definition on a web node. The newest
//! configuration per `(tenant, protocol)` wins; older configurations are
//! removed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::authorization::{Authorization, AuthorizationBuilder};
use crate::endpoint::{Message, Reply, Status};
use crate::provider::{EventLog, EventStream, MessageStore, Provider, Signer};
use crate::records::DelegatedGrant;
use crate::store::{Entry, ProtocolsQuery};
use crate::{
    Descriptor, Error, Interface, Method, Result, forbidden, invalid, permissions, protocols,
    unexpected, utils,
};
use serde_json::Value;

use super::{Action, Actor, Definition, MAX_NESTING_DEPTH, RuleSet};

/// Handle — or process — a [`Configure`] message.
///
/// # Errors
///
/// The endpoint will return an error when message authorization fails or
/// when an issue occurs saving the configuration.
pub async fn handle(
    owner: &str, configure: Configure, provider: &impl Provider,
) -> Result<Reply<ConfigureReply>> {
    configure.authorization.verify(provider).await.map_err(|e| {
        Error::Unauthorized(format!("failed to authenticate: {e}"))
    })?;
    configure.validate_definition()?;
    configure.authorize(owner, provider).await?;

    // fetch any existing configurations for the protocol
    let query = ProtocolsQuery {
        protocol: Some(configure.descriptor.definition.protocol.clone()),
        published: None,
    };
    let (existing, _) = MessageStore::query(provider, owner, &query.into()).await?;

    // the incoming message must be newer than every existing configuration
    let incoming_key = (configure.descriptor.base.message_timestamp, configure.cid()?);
    for entry in &existing {
        let entry_key = (entry.descriptor().message_timestamp, entry.cid()?);
        if incoming_key <= entry_key {
            return Err(Error::Conflict("a newer configuration exists".to_string()));
        }
    }

    let entry = Entry::from(&configure);
    MessageStore::put(provider, owner, &entry).await?;
    EventLog::append(provider, owner, &entry).await?;
    EventStream::emit(provider, owner, &entry).await?;

    // remove superseded configurations
    for entry in &existing {
        let cid = entry.cid()?;
        MessageStore::delete(provider, owner, &cid).await?;
        EventLog::delete(provider, owner, &cid).await?;
    }

    Ok(Reply {
        status: Status {
            code: StatusCode::ACCEPTED.as_u16(),
            detail: None,
        },
        body: Some(ConfigureReply { message: configure }),
    })
}

/// The [`Configure`] message expected by the handler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Configure {
    /// The Configure descriptor.
    pub descriptor: ConfigureDescriptor,

    /// The message authorization.
    pub authorization: Authorization,
}

impl Message for Configure {
    type Reply = ConfigureReply;

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

/// [`ConfigureReply`] is returned by the handler in the [`Reply`] `body`
/// field.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureReply {
    /// The configuration as persisted.
    pub message: Configure,
}

impl Configure {
    /// Build flattened indexes for the configure message.
    #[must_use]
    pub(crate) fn build_indexes(&self) -> BTreeMap<String, Value> {
        let mut indexes = BTreeMap::new();
        indexes.insert("interface".to_string(), Value::String(Interface::Protocols.to_string()));
        indexes.insert("method".to_string(), Value::String(Method::Configure.to_string()));
        indexes.insert(
            "protocol".to_string(),
            Value::String(self.descriptor.definition.protocol.clone()),
        );
        indexes
            .insert("published".to_string(), Value::Bool(self.descriptor.definition.published));
        indexes.insert(
            "messageTimestamp".to_string(),
            Value::String(
                self.descriptor
                    .base
                    .message_timestamp
                    .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ),
        );
        if let Ok(author) = self.authorization.author() {
            indexes.insert("author".to_string(), Value::String(author));
        }
        indexes
    }

    // Validate the structure of the definition carried by the message.
    fn validate_definition(&self) -> Result<()> {
        let definition = &self.descriptor.definition;
        utils::uri::validate(&definition.protocol)?;
        verify_structure(definition)
    }

    // Check the message has sufficient privileges to configure a protocol.
    async fn authorize(&self, owner: &str, provider: &impl Provider) -> Result<()> {
        let authzn = &self.authorization;
        let author = authzn.author()?;

        // authorize the author-delegate who signed the message
        if let Some(delegated) = &authzn.author_delegated_grant {
            let grant = delegated.to_grant()?;
            grant.verify_delegated(&author, &authzn.signer()?)?;
            grant.verify(owner, self.descriptor(), provider).await?;
            grant.verify_protocol_scope(
                Interface::Protocols,
                Some(&self.descriptor.definition.protocol),
            )?;
        }

        if author == owner {
            return Ok(());
        }

        // a non-owner author requires a permission grant
        let Some(grant_id) = authzn.payload()?.permission_grant_id else {
            return Err(forbidden!("author is not authorized to configure protocols"));
        };
        let grant = permissions::fetch_grant(owner, &grant_id, provider).await?;
        if grant.grantee != author {
            return Err(forbidden!("grant not granted to author"));
        }
        if grant.grantor != owner {
            return Err(forbidden!("grant not granted by web node owner"));
        }
        grant.verify(owner, self.descriptor(), provider).await?;
        grant.verify_protocol_scope(
            Interface::Protocols,
            Some(&self.descriptor.definition.protocol),
        )?;

        Ok(())
    }
}

/// Configure descriptor.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureDescriptor {
    /// The base descriptor.
    #[serde(flatten)]
    pub base: Descriptor,

    /// The protocol definition.
    pub definition: Definition,
}

/// Builds a [`Configure`] message.
#[derive(Clone, Debug, Default)]
pub struct ConfigureBuilder {
    message_timestamp: Option<DateTime<Utc>>,
    definition: Option<Definition>,
    delegated_grant: Option<DelegatedGrant>,
    permission_grant_id: Option<String>,
}

impl ConfigureBuilder {
    /// Returns a new [`ConfigureBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_timestamp: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Specify the protocol definition to install.
    #[must_use]
    pub fn definition(mut self, definition: Definition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Specify the message timestamp.
    #[must_use]
    pub const fn message_timestamp(mut self, message_timestamp: DateTime<Utc>) -> Self {
        self.message_timestamp = Some(message_timestamp);
        self
    }

    /// The delegated grant invoked to sign on behalf of the logical author,
    /// who is the grantor of the delegated grant.
    #[must_use]
    pub fn delegated_grant(mut self, delegated_grant: DelegatedGrant) -> Self {
        self.delegated_grant = Some(delegated_grant);
        self
    }

    /// Specify a permission grant ID to use for authorization.
    #[must_use]
    pub fn permission_grant_id(mut self, permission_grant_id: impl Into<String>) -> Self {
        self.permission_grant_id = Some(permission_grant_id.into());
        self
    }

    /// Generate and sign the Configure message.
    ///
    /// # Errors
    ///
    /// Fails when the definition is unset or invalid, or signing fails.
    pub async fn build(self, signer: &impl Signer) -> Result<Configure> {
        let Some(mut definition) = self.definition else {
            return Err(unexpected!("definition not set"));
        };

        // normalize definition urls
        definition.protocol = utils::clean_url(&definition.protocol)?;
        for protocol_type in definition.types.values_mut() {
            if let Some(schema) = &protocol_type.schema {
                protocol_type.schema = Some(utils::clean_url(schema)?);
            }
        }
        verify_structure(&definition)?;

        let descriptor = ConfigureDescriptor {
            base: Descriptor {
                interface: Interface::Protocols,
                method: Method::Configure,
                message_timestamp: self.message_timestamp.unwrap_or_else(Utc::now),
            },
            definition,
        };

        let mut builder = AuthorizationBuilder::new().descriptor(&descriptor)?;
        if let Some(id) = self.permission_grant_id {
            builder = builder.permission_grant_id(id);
        }
        if let Some(delegated_grant) = self.delegated_grant {
            builder = builder.delegated_grant(delegated_grant);
        }
        let authorization = builder.build(signer).await?;

        Ok(Configure {
            descriptor,
            authorization,
        })
    }
}

// Validates the definition's structure, recursively validating nested rule
// sets.
pub(crate) fn verify_structure(definition: &Definition) -> Result<()> {
    let types = definition.types.keys().collect::<Vec<&String>>();
    let roles = role_paths("", &definition.structure)?;

    for (type_name, rule_set) in &definition.structure {
        if !types.contains(&type_name) {
            return Err(invalid!("rule set {type_name} is not declared as a type"));
        }
        verify_rule_set(rule_set, type_name, &types, &roles)?;
    }

    Ok(())
}

// Validates a rule set at `protocol_path`, recursing into nested sets.
fn verify_rule_set(
    rule_set: &RuleSet, protocol_path: &str, types: &[&String], roles: &[String],
) -> Result<()> {
    if protocol_path.split('/').count() > MAX_NESTING_DEPTH {
        return Err(invalid!("record nesting depth exceeds {MAX_NESTING_DEPTH} levels"));
    }

    if let Some(size) = &rule_set.size {
        if let (Some(min), Some(max)) = (size.min, size.max) {
            if min > max {
                return Err(invalid!("invalid size range at '{protocol_path}'"));
            }
        }
    }

    // tag schemas must compile
    if let Some(tags) = &rule_set.tags {
        for (tag, schema) in &tags.defined_tags {
            jsonschema::validator_for(schema)
                .map_err(|e| invalid!("tag schema for '{tag}' is invalid: {e}"))?;
        }
    }

    let empty = Vec::new();
    let mut rule_iter = rule_set.actions.as_ref().unwrap_or(&empty).iter();

    while let Some(rule) = rule_iter.next() {
        // rules are either actor rules or role rules
        if rule.who.is_some() && rule.role.is_some() {
            return Err(invalid!("rule at '{protocol_path}' sets both `who` and `role`"));
        }

        if let Some(role) = &rule.role {
            // role must be a valid protocol path to a role record
            if !roles.contains(role) {
                return Err(invalid!("missing role {role} in action for {protocol_path}"));
            }
        } else {
            // `query` and `subscribe` are only authorized through roles
            if rule.can.contains(&Action::Query) || rule.can.contains(&Action::Subscribe) {
                return Err(invalid!(
                    "'query' and 'subscribe' are only allowed in role rules at {protocol_path}"
                ));
            }
        }

        // when `who` is `anyone`, `of` cannot be set
        if rule.who == Some(Actor::Anyone) && rule.of.is_some() {
            return Err(invalid!("`of` must not be set when `who` is 'anyone' at {protocol_path}"));
        }

        // when `who` is `author`, `of` must be set
        if rule.who == Some(Actor::Author) && rule.of.is_none() {
            return Err(invalid!("`of` must be set when `who` is 'author' at {protocol_path}"));
        }

        // recipients can always read records addressed to them; a recipient
        // rule granting `read` is rejected at configure time
        if rule.who == Some(Actor::Recipient) && rule.can.contains(&Action::Read) {
            return Err(invalid!("recipient rule at {protocol_path} must not grant 'read'"));
        }

        // When `who` is "recipient" and `of` is unset, `can` must only
        // contain co-actions: there is no recipient until the record has
        // been created.
        if rule.who == Some(Actor::Recipient) && rule.of.is_none() {
            let allowed = [Action::CoUpdate, Action::CoDelete, Action::CoPrune];
            if !rule.can.iter().all(|action| allowed.contains(action)) {
                return Err(invalid!(
                    "recipient rule at {protocol_path} can only contain co-update, co-delete, and co-prune"
                ));
            }
        }

        // when `can` contains `update` or `delete`, it must also contain `create`
        if rule.can.contains(&Action::Update) && !rule.can.contains(&Action::Create) {
            return Err(invalid!("rule at {protocol_path} contains 'update' but no 'create'"));
        }
        if rule.can.contains(&Action::Delete) && !rule.can.contains(&Action::Create) {
            return Err(invalid!("rule at {protocol_path} contains 'delete' but no 'create'"));
        }

        // no two rules may target the same actor (`who` + `of`) or role
        for other in rule_iter.clone() {
            if rule.who.is_some() {
                if rule.who == other.who && rule.of == other.of {
                    return Err(invalid!(
                        "duplicate actor rule at {protocol_path}: {who:?} of {of:?}",
                        who = rule.who,
                        of = rule.of
                    ));
                }
            } else if rule.role == other.role {
                return Err(invalid!(
                    "duplicate role rule at {protocol_path}: {role:?}",
                    role = rule.role
                ));
            }
        }
    }

    // verify nested rule sets
    for (type_name, nested) in &rule_set.nested {
        if !types.contains(&type_name) {
            return Err(invalid!("rule set {type_name} is not declared as a type"));
        }
        verify_rule_set(nested, &format!("{protocol_path}/{type_name}"), types, roles)?;
    }

    Ok(())
}

// Collect all protocol paths of role record types in the structure.
fn role_paths(parent_path: &str, structure: &BTreeMap<String, RuleSet>) -> Result<Vec<String>> {
    if parent_path.split('/').count() > MAX_NESTING_DEPTH {
        return Err(invalid!("record nesting depth exceeds {MAX_NESTING_DEPTH} levels"));
    }

    let mut roles = Vec::new();
    for (type_name, rule_set) in structure {
        let protocol_path = if parent_path.is_empty() {
            type_name.clone()
        } else {
            format!("{parent_path}/{type_name}")
        };

        if rule_set.role.unwrap_or_default() {
            roles.push(protocol_path.clone());
        }
        roles.extend(role_paths(&protocol_path, &rule_set.nested)?);
    }

    Ok(roles)
}

// Fetch the newest installed definition for the protocol, falling back to
// the built-in permissions protocol definition.
pub(crate) async fn fetch_definition(
    owner: &str, protocol_uri: &str, store: &impl MessageStore,
) -> Result<Definition> {
    let protocol_uri = utils::clean_url(protocol_uri)?;

    // use the built-in definition for the first-class permissions protocol
    if protocol_uri == protocols::PROTOCOL_URI {
        return Ok(protocols::permissions_definition());
    }

    let query = ProtocolsQuery {
        protocol: Some(protocol_uri.clone()),
        published: None,
    };
    let (entries, _) = store.query(owner, &query.into()).await?;

    // the store holds at most one configuration per protocol
    let Some(entry) = entries.first() else {
        return Err(Error::NotFound(format!("protocol {protocol_uri} is not installed")));
    };
    let Some(configure) = entry.as_configure() else {
        return Err(unexpected!("expected `ProtocolsConfigure` message"));
    };

    Ok(configure.descriptor.definition.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn definition(value: serde_json::Value) -> Definition {
        serde_json::from_value(value).expect("should deserialize")
    }

    #[test]
    fn update_requires_create() {
        let definition = definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}},
            "structure": {
                "chat": {
                    "$actions": [{"who": "anyone", "can": ["update"]}]
                }
            }
        }));
        assert!(verify_structure(&definition).is_err());
    }

    #[test]
    fn anyone_cannot_have_of() {
        let definition = definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}},
            "structure": {
                "chat": {
                    "$actions": [{"who": "anyone", "of": "chat", "can": ["create"]}]
                }
            }
        }));
        assert!(verify_structure(&definition).is_err());
    }

    #[test]
    fn recipient_without_of_is_co_only() {
        let definition = definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}},
            "structure": {
                "chat": {
                    "$actions": [{"who": "recipient", "can": ["create"]}]
                }
            }
        }));
        assert!(verify_structure(&definition).is_err());

        let definition = self::definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}},
            "structure": {
                "chat": {
                    "$actions": [{"who": "recipient", "can": ["co-update", "co-delete"]}]
                }
            }
        }));
        assert!(verify_structure(&definition).is_ok());
    }

    #[test]
    fn role_must_reference_role_record() {
        let definition = definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}, "admin": {}},
            "structure": {
                "admin": {},
                "chat": {
                    "$actions": [{"role": "admin", "can": ["create"]}]
                }
            }
        }));
        assert!(verify_structure(&definition).is_err());

        let definition = self::definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}, "admin": {}},
            "structure": {
                "admin": {"$role": true},
                "chat": {
                    "$actions": [{"role": "admin", "can": ["create"]}]
                }
            }
        }));
        assert!(verify_structure(&definition).is_ok());
    }

    #[test]
    fn nesting_depth_boundary() {
        // a structure at the maximum depth is accepted, one level deeper is
        // rejected
        fn nested(depth: usize) -> serde_json::Value {
            let mut node = json!({});
            for _ in 1..depth {
                node = json!({"leaf": node});
            }
            node
        }

        let at_limit = definition(json!({
            "protocol": "https://example.com/deep",
            "published": false,
            "types": {"leaf": {}},
            "structure": {"leaf": nested(MAX_NESTING_DEPTH)}
        }));
        assert!(verify_structure(&at_limit).is_ok());

        let too_deep = definition(json!({
            "protocol": "https://example.com/deep",
            "published": false,
            "types": {"leaf": {}},
            "structure": {"leaf": nested(MAX_NESTING_DEPTH + 1)}
        }));
        assert!(verify_structure(&too_deep).is_err());
    }

    #[test]
    fn duplicate_actor_rules_rejected() {
        let definition = definition(json!({
            "protocol": "https://example.com/chat",
            "published": false,
            "types": {"chat": {}},
            "structure": {
                "chat": {
                    "$actions": [
                        {"who": "anyone", "can": ["create"]},
                        {"who": "anyone", "can": ["read"]}
                    ]
                }
            }
        }));
        assert!(verify_structure(&definition).is_err());
    }

    #[test]
    fn permissions_definition_is_valid() {
        assert!(verify_structure(&protocols::permissions_definition()).is_ok());
    }
}
