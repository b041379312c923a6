//! Protocols

use chrono::Duration;
use dwn_core::endpoint;
use dwn_core::protocols::{ConfigureBuilder, Definition, QueryBuilder};
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, WriteBuilder, WriteProtocol};
use dwn_core::Error;
use http::StatusCode;
use serde_json::json;
use test_node::key_store::{ALICE_DID, BOB_DID, CAROL_DID};
use test_node::provider::ProviderImpl;

fn chat_definition() -> Definition {
    serde_json::from_value(json!({
        "protocol": "https://example.com/chat",
        "published": true,
        "types": {
            "thread": {},
            "chat": {},
            "admin": {}
        },
        "structure": {
            "admin": {
                "$role": true
            },
            "thread": {
                "$actions": [
                    {"who": "anyone", "can": ["create"]}
                ],
                "chat": {
                    "$actions": [
                        {"who": "author", "of": "thread", "can": ["create"]},
                        {"who": "recipient", "of": "thread", "can": ["create"]}
                    ]
                }
            }
        }
    }))
    .expect("should deserialize")
}

// Install a protocol and query it back, including anonymously when
// published.
#[tokio::test]
async fn configure_then_query() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice installs the chat protocol.
    // --------------------------------------------------
    let configure = ConfigureBuilder::new()
        .definition(chat_definition())
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice queries for the installed protocol.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter("https://example.com/chat")
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].descriptor.definition.protocol, "https://example.com/chat");

    // --------------------------------------------------
    // The published definition is visible anonymously.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter("https://example.com/chat")
        .anonymous()
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert!(reply.body.expect("should have body").entries.is_some());
}

// The newest configuration per protocol wins; older submissions conflict.
#[tokio::test]
async fn configure_newest_wins() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let newer = ConfigureBuilder::new()
        .definition(chat_definition())
        .build(&alice_keyring)
        .await
        .expect("should build");

    // an older configuration for the same protocol
    let older = ConfigureBuilder::new()
        .definition(chat_definition())
        .message_timestamp(newer.descriptor.base.message_timestamp - Duration::seconds(10))
        .build(&alice_keyring)
        .await
        .expect("should build");

    let reply = endpoint::handle(&ALICE_DID, newer, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let Err(Error::Conflict(_)) = endpoint::handle(&ALICE_DID, older, &provider).await else {
        panic!("should be Conflict");
    };
}

// Definitions violating structural invariants are rejected.
#[tokio::test]
async fn invalid_definitions_rejected() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // `update` without `create`
    let definition: Definition = serde_json::from_value(json!({
        "protocol": "https://example.com/bad",
        "published": false,
        "types": {"note": {}},
        "structure": {
            "note": {"$actions": [{"who": "anyone", "can": ["update"]}]}
        }
    }))
    .expect("should deserialize");
    assert!(ConfigureBuilder::new().definition(definition).build(&alice_keyring).await.is_err());

    // `query` outside a role rule
    let definition: Definition = serde_json::from_value(json!({
        "protocol": "https://example.com/bad",
        "published": false,
        "types": {"note": {}},
        "structure": {
            "note": {"$actions": [{"who": "anyone", "can": ["query"]}]}
        }
    }))
    .expect("should deserialize");
    assert!(ConfigureBuilder::new().definition(definition).build(&alice_keyring).await.is_err());
}

// Anyone can create a thread; only thread participants can chat in it.
#[tokio::test]
async fn anyone_and_ancestor_rules() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");

    let configure = ConfigureBuilder::new()
        .definition(chat_definition())
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob (anyone) creates a thread on Alice's web node, addressed to
    // Carol.
    // --------------------------------------------------
    let thread = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/chat".to_string(),
            protocol_path: "thread".to_string(),
        })
        .recipient(CAROL_DID.as_str())
        .data(Data::from(b"a thread".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, thread.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Carol, the thread's recipient, posts a chat into it.
    // --------------------------------------------------
    let chat = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/chat".to_string(),
            protocol_path: "thread/chat".to_string(),
        })
        .parent_context_id(thread.context_id.clone().unwrap())
        .data(Data::from(b"hi bob".to_vec()))
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, chat, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice, neither author nor recipient of the thread, cannot chat
    // through protocol rules alone — but she is the tenant, so she can.
    // Use a different protocol-less check: the thread author Bob can chat.
    // --------------------------------------------------
    let chat = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/chat".to_string(),
            protocol_path: "thread/chat".to_string(),
        })
        .parent_context_id(thread.context_id.clone().unwrap())
        .data(Data::from(b"hi carol".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, chat, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}

// A role rule authorizes its holder to create records; updating still
// requires being the author of the create.
#[tokio::test]
async fn role_authorization() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    // --------------------------------------------------
    // Alice installs a protocol with an `admin` role that can create
    // `foo` records.
    // --------------------------------------------------
    let definition: Definition = serde_json::from_value(json!({
        "protocol": "https://example.com/rolecast",
        "published": false,
        "types": {
            "admin": {},
            "foo": {}
        },
        "structure": {
            "admin": {
                "$role": true
            },
            "foo": {
                "$actions": [
                    {"role": "admin", "can": ["create"]}
                ]
            }
        }
    }))
    .expect("should deserialize");

    let configure = ConfigureBuilder::new()
        .definition(definition)
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice assigns Bob the `admin` role.
    // --------------------------------------------------
    let role = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/rolecast".to_string(),
            protocol_path: "admin".to_string(),
        })
        .recipient(BOB_DID.as_str())
        .data(Data::from(b"bob is admin".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, role, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob invokes the role to create a `foo` record.
    // --------------------------------------------------
    let foo = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/rolecast".to_string(),
            protocol_path: "foo".to_string(),
        })
        .protocol_role("admin")
        .data(Data::from(b"created by role".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, foo.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob's update without invoking the role is refused: the role only
    // grants `create`.
    // --------------------------------------------------
    let update = WriteBuilder::from(foo.clone())
        .data(Data::from(b"updated by role".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(_)) = endpoint::handle(&ALICE_DID, update, &provider).await else {
        panic!("should be Forbidden");
    };

    // --------------------------------------------------
    // Carol, without the role, cannot create a `foo` record.
    // --------------------------------------------------
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");
    let foo = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/rolecast".to_string(),
            protocol_path: "foo".to_string(),
        })
        .protocol_role("admin")
        .data(Data::from(b"no role".to_vec()))
        .build(&carol_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(_)) = endpoint::handle(&ALICE_DID, foo, &provider).await else {
        panic!("should be Forbidden");
    };
}

// A record declaring an uninstalled protocol is rejected.
#[tokio::test]
async fn unknown_protocol_rejected() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/uninstalled".to_string(),
            protocol_path: "note".to_string(),
        })
        .data(Data::from(b"note".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");

    let Err(Error::NotFound(_)) = endpoint::handle(&ALICE_DID, write, &provider).await else {
        panic!("should be NotFound");
    };
}
