//! # Protocol
//!
//! Protocol-based validation and authorization of records messages.
//! Incoming messages are checked against the newest installed definition
//! for their protocol: structural integrity at write time, and action
//! rules (anyone, author-of-ancestor, recipient-of-ancestor, role) when
//! the author is neither the tenant nor covered by a permission grant.

use serde_json::json;

use crate::protocols::{self, Action, ActionRule, Actor, Definition, RuleSet};
use crate::provider::MessageStore;
use crate::records::{self, Delete, Read, RecordsFilter, Subscribe, Write};
use crate::store::RecordsQueryBuilder;
use crate::{Result, forbidden, invalid, utils};

/// Validate the structure of a protocol-bound `RecordsWrite` against the
/// installed definition.
pub(crate) async fn verify_integrity(
    owner: &str, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &write.descriptor.protocol else {
        return Err(invalid!("missing protocol"));
    };
    let definition = protocols::fetch_definition(owner, protocol, store).await?;
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(invalid!("no rule set defined for protocol path {protocol_path}"));
    };

    verify_type(write, &definition)?;
    verify_protocol_path(owner, write, store).await?;
    if rule_set.role.unwrap_or_default() {
        verify_role_record(owner, write, store).await?;
    }
    verify_size_limit(write.descriptor.data_size, &rule_set)?;
    verify_tags(write, &rule_set)?;

    Ok(())
}

// Verify the `schema` and `data_format` against the record's declared type.
fn verify_type(write: &Write, definition: &Definition) -> Result<()> {
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(invalid!("missing type name"));
    };
    let Some(protocol_type) = definition.types.get(type_name) else {
        return Err(invalid!("record with type {type_name} not allowed in protocol"));
    };

    if protocol_type.schema.is_some() && protocol_type.schema != write.descriptor.schema {
        return Err(invalid!("invalid schema for type {type_name}"));
    }
    if let Some(data_formats) = &protocol_type.data_formats {
        if !data_formats.contains(&write.descriptor.data_format) {
            return Err(invalid!("invalid data format for type {type_name}"));
        }
    }

    Ok(())
}

// Verify `protocol_path` and `context_id` match the record's actual
// parentage chain.
async fn verify_protocol_path(owner: &str, write: &Write, store: &impl MessageStore) -> Result<()> {
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(invalid!("missing protocol path"));
    };
    let Some(type_name) = protocol_path.split('/').next_back() else {
        return Err(invalid!("missing type name"));
    };
    let Some(context_id) = &write.context_id else {
        return Err(invalid!("missing context ID"));
    };

    let Some(parent_id) = &write.descriptor.parent_id else {
        // a parentless record is a root record
        if protocol_path != type_name {
            return Err(invalid!("invalid protocol path for parentless record"));
        }
        if context_id != &write.record_id {
            return Err(invalid!("invalid context ID for parentless record"));
        }
        return Ok(());
    };

    // fetch the parent record
    let Some(parent) = records::initial_write(owner, parent_id, store).await? else {
        return Err(invalid!("unable to find parent record {parent_id}"));
    };
    if parent.descriptor.protocol != write.descriptor.protocol {
        return Err(invalid!("parent record is not bound to the same protocol"));
    }

    // the child's protocol path extends the parent's by one segment
    let Some(parent_path) = &parent.descriptor.protocol_path else {
        return Err(invalid!("parent record has no protocol path"));
    };
    if protocol_path != &format!("{parent_path}/{type_name}") {
        return Err(invalid!("invalid `protocol_path`"));
    }

    // the child's context extends the parent's by its own record ID
    let Some(parent_context) = &parent.context_id else {
        return Err(invalid!("parent record has no context ID"));
    };
    if context_id != &format!("{parent_context}/{record_id}", record_id = write.record_id) {
        return Err(invalid!("invalid `context_id`"));
    }

    // records are never older than their parent
    if write.descriptor.date_created < parent.descriptor.date_created {
        return Err(invalid!("record cannot predate its parent"));
    }

    Ok(())
}

// A role record assigns its role to its recipient; a recipient may hold a
// given role at most once per context.
async fn verify_role_record(owner: &str, write: &Write, store: &impl MessageStore) -> Result<()> {
    let Some(recipient) = &write.descriptor.recipient else {
        return Err(invalid!("role record is missing recipient"));
    };

    let mut filter = RecordsFilter::new()
        .protocol(write.descriptor.protocol.clone().unwrap_or_default())
        .protocol_path(write.descriptor.protocol_path.clone().unwrap_or_default())
        .add_recipient(recipient);

    // scope the uniqueness check to the parent context for context roles
    if let Some(parent_context) =
        write.context_id.as_ref().and_then(|id| id.rsplit_once('/').map(|(parent, _)| parent))
    {
        filter = filter.context_id(parent_context);
    }

    let query = RecordsQueryBuilder::new().add_filter(filter).build();
    let (entries, _) = store.query(owner, &query).await?;

    for entry in entries {
        if let Some(existing) = entry.as_write() {
            if existing.record_id != write.record_id {
                return Err(invalid!("recipient {recipient} already holds this role"));
            }
        }
    }

    Ok(())
}

// Verify the record data adheres to the rule set's `$size` constraints.
fn verify_size_limit(data_size: usize, rule_set: &RuleSet) -> Result<()> {
    let Some(range) = &rule_set.size else {
        return Ok(());
    };
    let data_size = data_size as u64;

    if let Some(min) = range.min {
        if data_size < min {
            return Err(invalid!("data size is less than allowed"));
        }
    }
    if let Some(max) = range.max {
        if data_size > max {
            return Err(invalid!("data size is greater than allowed"));
        }
    }

    Ok(())
}

// Verify the record's tags against the rule set's `$tags` schema.
fn verify_tags(write: &Write, rule_set: &RuleSet) -> Result<()> {
    let Some(rule_tags) = &rule_set.tags else {
        return Ok(());
    };

    let schema = json!({
        "type": "object",
        "properties": rule_tags.defined_tags,
        "required": rule_tags.required_tags.clone().unwrap_or_default(),
        "additionalProperties": rule_tags.allow_undefined_tags.unwrap_or_default(),
    });
    let instance = serde_json::to_value(write.descriptor.tags.clone().unwrap_or_default())?;

    if !jsonschema::is_valid(&schema, &instance) {
        return Err(invalid!("record tags do not match protocol schema"));
    }

    Ok(())
}

/// Protocol-based authorization for `RecordsWrite` messages.
pub(crate) async fn permit_write(owner: &str, write: &Write, store: &impl MessageStore) -> Result<()> {
    let author = write.authorization.author()?;
    let initial = records::initial_write(owner, &write.record_id, store).await?;

    // candidate actions the message is asking for
    let allowed_actions = if let Some(initial) = &initial {
        if author == initial.authorization.author()? {
            vec![Action::Update, Action::CoUpdate]
        } else {
            vec![Action::CoUpdate]
        }
    } else {
        vec![Action::Create]
    };

    // the chain of existing ancestors: the record's own chain for updates,
    // the parent's chain for creates
    let record_chain = if initial.is_some() {
        record_chain(owner, &write.record_id, store).await?
    } else if let Some(parent_id) = &write.descriptor.parent_id {
        record_chain(owner, parent_id, store).await?
    } else {
        vec![]
    };

    let Some(protocol) = &write.descriptor.protocol else {
        return Err(forbidden!("missing protocol"));
    };
    let definition = protocols::fetch_definition(owner, protocol, store)
        .await
        .map_err(|_| forbidden!("unable to fetch protocol definition"))?;
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(forbidden!("missing protocol path"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!("no rule set defined for protocol path"));
    };

    let invoked_role = write.signature_payload()?.base.protocol_role;
    if let Some(role) = &invoked_role {
        verify_invoked_role(owner, &author, role, protocol, write.context_id.as_deref(), &definition, store)
            .await?;
    }

    verify_actions(&author, invoked_role.as_deref(), &rule_set, &allowed_actions, &record_chain, write)
}

/// Protocol-based authorization for `RecordsDelete` messages, evaluated
/// against the initial write of the record being deleted.
pub(crate) async fn permit_delete(
    owner: &str, delete: &Delete, initial: &Write, store: &impl MessageStore,
) -> Result<()> {
    let author = delete.authorization.author()?;

    let mut allowed_actions = vec![Action::CoDelete];
    if delete.descriptor.prune {
        allowed_actions.push(Action::CoPrune);
    }
    if author == initial.authorization.author()? {
        allowed_actions.push(Action::Delete);
        if delete.descriptor.prune {
            allowed_actions.push(Action::Prune);
        }
    }

    let record_chain = record_chain(owner, &delete.descriptor.record_id, store).await?;

    let Some(protocol) = &initial.descriptor.protocol else {
        return Err(forbidden!("record is not bound to a protocol"));
    };
    let definition = protocols::fetch_definition(owner, protocol, store)
        .await
        .map_err(|_| forbidden!("unable to fetch protocol definition"))?;
    let Some(protocol_path) = &initial.descriptor.protocol_path else {
        return Err(forbidden!("record has no protocol path"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!("no rule set defined for protocol path"));
    };

    let invoked_role = delete.authorization.payload()?.protocol_role;
    if let Some(role) = &invoked_role {
        verify_invoked_role(
            owner,
            &author,
            role,
            protocol,
            initial.context_id.as_deref(),
            &definition,
            store,
        )
        .await?;
    }

    verify_actions(&author, invoked_role.as_deref(), &rule_set, &allowed_actions, &record_chain, initial)
}

/// Protocol-based authorization for `RecordsRead` messages, evaluated
/// against the record being read.
pub(crate) async fn permit_read(
    owner: &str, read: &Read, write: &Write, store: &impl MessageStore,
) -> Result<()> {
    let Some(authzn) = &read.authorization else {
        return Err(forbidden!("missing authorization"));
    };
    let author = authzn.author()?;

    let record_chain = record_chain(owner, &write.record_id, store).await?;

    let Some(protocol) = &write.descriptor.protocol else {
        return Err(forbidden!("record is not bound to a protocol"));
    };
    let definition = protocols::fetch_definition(owner, protocol, store)
        .await
        .map_err(|_| forbidden!("unable to fetch protocol definition"))?;
    let Some(protocol_path) = &write.descriptor.protocol_path else {
        return Err(forbidden!("record has no protocol path"));
    };
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!("no rule set defined for protocol path"));
    };

    let invoked_role = authzn.payload()?.protocol_role;
    if let Some(role) = &invoked_role {
        verify_invoked_role(
            owner,
            &author,
            role,
            protocol,
            write.context_id.as_deref(),
            &definition,
            store,
        )
        .await?;
    }

    verify_actions(&author, invoked_role.as_deref(), &rule_set, &[Action::Read], &record_chain, write)
}

/// Protocol-based authorization for role-invoking records queries and
/// subscriptions: the filter's protocol path must carry a rule permitting
/// the action for the invoked role.
pub(crate) async fn permit_query(
    owner: &str, author: &str, invoked_role: &str, action: Action, filter: &RecordsFilter,
    store: &impl MessageStore,
) -> Result<()> {
    let Some(protocol) = &filter.protocol else {
        return Err(forbidden!("missing protocol"));
    };
    let Some(protocol_path) = &filter.protocol_path else {
        return Err(forbidden!("missing protocol path"));
    };

    let definition = protocols::fetch_definition(owner, protocol, store)
        .await
        .map_err(|_| forbidden!("unable to fetch protocol definition"))?;
    let Some(rule_set) = rule_set(protocol_path, &definition.structure) else {
        return Err(forbidden!("no rule set defined for protocol path"));
    };

    verify_invoked_role(
        owner,
        author,
        invoked_role,
        protocol,
        filter.context_id.as_deref(),
        &definition,
        store,
    )
    .await?;

    // find a role rule permitting the action
    let empty = Vec::new();
    for rule in rule_set.actions.as_ref().unwrap_or(&empty) {
        if rule.role.as_deref() == Some(invoked_role) && rule.can.contains(&action) {
            return Ok(());
        }
    }

    Err(forbidden!("role {invoked_role} does not permit {action:?}"))
}

/// As [`permit_query`], for subscriptions.
pub(crate) async fn permit_subscribe(
    owner: &str, subscribe: &Subscribe, store: &impl MessageStore,
) -> Result<()> {
    let Some(authzn) = &subscribe.authorization else {
        return Err(forbidden!("missing authorization"));
    };
    let Some(role) = authzn.payload()?.protocol_role else {
        return Err(forbidden!("no protocol role invoked"));
    };
    permit_query(
        owner,
        &authzn.author()?,
        &role,
        Action::Subscribe,
        &subscribe.descriptor.filter,
        store,
    )
    .await
}

// Locate the rule set at the slash-separated protocol path.
fn rule_set(protocol_path: &str, structure: &std::collections::BTreeMap<String, RuleSet>) -> Option<RuleSet> {
    let Some((type_name, rest)) = protocol_path.split_once('/') else {
        return structure.get(protocol_path).cloned();
    };
    rule_set(rest, &structure.get(type_name)?.nested)
}

// Construct the chain of EXISTING records where the first entry is the
// root initial write and the last is the initial write of the record
// specified. Each ancestor is fetched once; rule evaluation works over
// this cached chain.
async fn record_chain(
    owner: &str, record_id: &str, store: &impl MessageStore,
) -> Result<Vec<Write>> {
    let mut chain = vec![];
    let mut current_id = Some(record_id.to_owned());

    while let Some(record_id) = &current_id {
        let Some(initial) = records::initial_write(owner, record_id, store).await? else {
            return Err(forbidden!("missing ancestor record {record_id}"));
        };
        current_id.clone_from(&initial.descriptor.parent_id);
        chain.push(initial);
    }

    // root record first
    chain.reverse();
    Ok(chain)
}

// Verify the author holds the invoked role: a latest-state role record at
// the role's protocol path must name the author as recipient, within the
// relevant context for context roles.
async fn verify_invoked_role(
    owner: &str, author: &str, role: &str, protocol: &str, context_id: Option<&str>,
    definition: &Definition, store: &impl MessageStore,
) -> Result<()> {
    let Some(role_rule_set) = rule_set(role, &definition.structure) else {
        return Err(forbidden!("no rule set defined for invoked role"));
    };
    if !role_rule_set.role.unwrap_or_default() {
        return Err(forbidden!("protocol path {role} is not a role record type"));
    }

    let mut filter = RecordsFilter::new()
        .protocol(utils::clean_url(protocol)?)
        .protocol_path(role)
        .add_recipient(author);

    // a context role's record must share the invoking record's context up
    // to the role's depth
    let segment_count = role.split('/').count();
    if segment_count > 1 {
        let Some(context_id) = context_id else {
            return Err(forbidden!("unable to verify role without a context"));
        };
        let segments: Vec<&str> = context_id.split('/').collect();
        if segments.len() < segment_count - 1 {
            return Err(forbidden!("context is too shallow for role {role}"));
        }
        filter = filter.context_id(segments[..segment_count - 1].join("/"));
    }

    let query = RecordsQueryBuilder::new().add_filter(filter).build();
    let (entries, _) = store.query(owner, &query).await?;
    if entries.is_empty() {
        return Err(forbidden!("unable to find role record for {role}"));
    }

    Ok(())
}

// Verify the message is authorized by one of the rule set's action rules.
fn verify_actions(
    author: &str, invoked_role: Option<&str>, rule_set: &RuleSet, allowed_actions: &[Action],
    record_chain: &[Write], record: &Write,
) -> Result<()> {
    // N.B. the tenant, owner-signature, and grant paths have already been
    // checked before this point
    let Some(action_rules) = &rule_set.actions else {
        return Err(forbidden!("no action rule defined, {author} is unauthorized"));
    };

    for rule in action_rules {
        if !rule.can.iter().any(|action| allowed_actions.contains(action)) {
            continue;
        }

        // a message invoking a role is authorized by its role rules alone
        if let Some(invoked) = invoked_role {
            if rule.role.as_deref() == Some(invoked) {
                return Ok(());
            }
            continue;
        }
        if rule.role.is_some() {
            continue;
        }

        if rule.who == Some(Actor::Anyone) {
            return Ok(());
        }

        // recipient of the record being acted upon
        if rule.who == Some(Actor::Recipient) && rule.of.is_none() {
            if record.descriptor.recipient.as_deref() == Some(author) {
                return Ok(());
            }
            continue;
        }

        // author or recipient of an ancestor
        if check_actor(author, rule, record_chain)? {
            return Ok(());
        }
    }

    Err(forbidden!("message by {author} not allowed by protocol"))
}

// Check the rule's `who`/`of` relation against the record chain.
fn check_actor(author: &str, rule: &ActionRule, record_chain: &[Write]) -> Result<bool> {
    let ancestor = record_chain
        .iter()
        .find(|write| write.descriptor.protocol_path == rule.of);
    let Some(ancestor) = ancestor else {
        // the chain holds no ancestor of the rule's type
        return Ok(false);
    };

    if rule.who == Some(Actor::Recipient) {
        return Ok(ancestor.descriptor.recipient.as_deref() == Some(author));
    }
    Ok(ancestor.authorization.author()? == author)
}
