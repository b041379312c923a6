//! Permissions

use chrono::{Duration, Utc};
use dwn_core::endpoint;
use dwn_core::permissions::{GrantBuilder, RevocationBuilder, Scope};
use dwn_core::protocols::{ConfigureBuilder, Definition};
use dwn_core::provider::KeyStore;
use dwn_core::records::{
    Data, DelegatedGrant, QueryBuilder, RecordsFilter, WriteBuilder, WriteProtocol,
};
use dwn_core::{Error, Method};
use http::StatusCode;
use serde_json::json;
use test_node::key_store::{ALICE_DID, APP_DID, BOB_DID};
use test_node::provider::ProviderImpl;

const CHAT_PROTOCOL: &str = "https://example.com/chat";

fn chat_definition() -> Definition {
    serde_json::from_value(json!({
        "protocol": CHAT_PROTOCOL,
        "published": false,
        "types": {"post": {}},
        "structure": {"post": {}}
    }))
    .expect("should deserialize")
}

fn write_scope() -> Scope {
    Scope::Records {
        method: Method::Write,
        protocol: Some(CHAT_PROTOCOL.to_string()),
        schema: None,
        options: None,
    }
}

async fn install_chat(provider: &ProviderImpl) {
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let configure = ConfigureBuilder::new()
        .definition(chat_definition())
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, configure, provider).await.expect("should configure");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);
}

// A grant lets its grantee write records within the granted scope.
#[tokio::test]
async fn grant_authorized_write() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    install_chat(&provider).await;

    // --------------------------------------------------
    // Alice grants Bob permission to write chat posts.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(BOB_DID.as_str())
        .scope(write_scope())
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    let reply = endpoint::handle(&ALICE_DID, grant.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob writes a post citing the grant.
    // --------------------------------------------------
    let post = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT_PROTOCOL.to_string(),
            protocol_path: "post".to_string(),
        })
        .permission_grant_id(&grant.record_id)
        .data(Data::from(b"bob's post".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, post.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice's query returns Bob's post.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().protocol(CHAT_PROTOCOL).protocol_path("post"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.authorization.author().unwrap(), *BOB_DID);
}

// A revoked grant no longer authorizes anything.
#[tokio::test]
async fn revoked_grant_rejected() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    install_chat(&provider).await;

    let grant = GrantBuilder::new()
        .granted_to(BOB_DID.as_str())
        .scope(write_scope())
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    let reply = endpoint::handle(&ALICE_DID, grant.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice revokes the grant before Bob uses it.
    // --------------------------------------------------
    let revocation = RevocationBuilder::new()
        .grant(grant.clone())
        .build(&alice_keyring)
        .await
        .expect("should create revocation");
    let reply = endpoint::handle(&ALICE_DID, revocation, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob's write citing the revoked grant is refused.
    // --------------------------------------------------
    let post = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT_PROTOCOL.to_string(),
            protocol_path: "post".to_string(),
        })
        .permission_grant_id(&grant.record_id)
        .data(Data::from(b"too late".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(&ALICE_DID, post, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "grant has been revoked");
}

// An expired grant no longer authorizes anything.
#[tokio::test]
async fn expired_grant_rejected() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    install_chat(&provider).await;

    let grant = GrantBuilder::new()
        .granted_to(BOB_DID.as_str())
        .date_expires(Utc::now() + Duration::seconds(1))
        .scope(write_scope())
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    let reply = endpoint::handle(&ALICE_DID, grant.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // a write timestamped after expiry is refused
    let post = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT_PROTOCOL.to_string(),
            protocol_path: "post".to_string(),
        })
        .permission_grant_id(&grant.record_id)
        .message_timestamp(Utc::now() + Duration::seconds(5))
        .data(Data::from(b"too late".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(&ALICE_DID, post, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "grant has expired");
}

// A grant's scope binds: a write outside the granted protocol is refused.
#[tokio::test]
async fn scope_mismatch_rejected() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    install_chat(&provider).await;

    // install a second protocol the grant does not cover
    let definition: Definition = serde_json::from_value(json!({
        "protocol": "https://example.com/other",
        "published": false,
        "types": {"note": {}},
        "structure": {"note": {}}
    }))
    .expect("should deserialize");
    let configure = ConfigureBuilder::new()
        .definition(definition)
        .build(&alice_keyring)
        .await
        .expect("should build");
    endpoint::handle(&ALICE_DID, configure, &provider).await.expect("should configure");

    let grant = GrantBuilder::new()
        .granted_to(BOB_DID.as_str())
        .scope(write_scope())
        .build(&alice_keyring)
        .await
        .expect("should create grant");
    endpoint::handle(&ALICE_DID, grant.clone(), &provider).await.expect("should write");

    let note = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/other".to_string(),
            protocol_path: "note".to_string(),
        })
        .permission_grant_id(&grant.record_id)
        .data(Data::from(b"out of scope".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");
    let Err(Error::Forbidden(e)) = endpoint::handle(&ALICE_DID, note, &provider).await else {
        panic!("should be Forbidden");
    };
    assert_eq!(e, "record protocol is not within grant scope");
}

// An author-delegated grant lets an app write *as* the grantor.
#[tokio::test]
async fn author_delegated_write() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let app_keyring = provider.keyring(&APP_DID).expect("should get the app's keyring");
    install_chat(&provider).await;

    // --------------------------------------------------
    // Alice issues a delegated grant to the app.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(APP_DID.as_str())
        .delegated(true)
        .scope(write_scope())
        .build(&alice_keyring)
        .await
        .expect("should create grant");

    // --------------------------------------------------
    // The app signs a write on Alice's behalf.
    // --------------------------------------------------
    let delegated: DelegatedGrant = grant.try_into().expect("should convert");
    let post = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT_PROTOCOL.to_string(),
            protocol_path: "post".to_string(),
        })
        .delegated_grant(delegated)
        .data(Data::from(b"posted by the app".to_vec()))
        .build(&app_keyring)
        .await
        .expect("should create write");

    // the logical author is Alice, the signer is the app
    assert_eq!(post.authorization.author().unwrap(), *ALICE_DID);
    assert_eq!(post.authorization.signer().unwrap(), *APP_DID);

    let reply = endpoint::handle(&ALICE_DID, post.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // The record is attributed to Alice.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&post.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries[0].write.authorization.author().unwrap(), *ALICE_DID);
}

// An owner-delegated grant lets an app retain an externally authored
// message on the tenant's behalf.
#[tokio::test]
async fn owner_delegated_retention() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    let app_keyring = provider.keyring(&APP_DID).expect("should get the app's keyring");
    install_chat(&provider).await;

    // --------------------------------------------------
    // Alice issues a delegated grant to the app.
    // --------------------------------------------------
    let grant = GrantBuilder::new()
        .granted_to(APP_DID.as_str())
        .delegated(true)
        .scope(write_scope())
        .build(&alice_keyring)
        .await
        .expect("should create grant");

    // --------------------------------------------------
    // Bob authors a post; the app augments it with an owner signature
    // citing the delegated grant and submits it to Alice's web node.
    // --------------------------------------------------
    let mut post = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: CHAT_PROTOCOL.to_string(),
            protocol_path: "post".to_string(),
        })
        .data(Data::from(b"bob's guest post".to_vec()))
        .build(&bob_keyring)
        .await
        .expect("should create write");

    let delegated: DelegatedGrant = grant.try_into().expect("should convert");
    post.sign_as_delegate(delegated, &app_keyring).await.expect("should sign");

    let reply = endpoint::handle(&ALICE_DID, post.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice's query returns the post, authored by Bob.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().protocol(CHAT_PROTOCOL).protocol_path("post"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.authorization.author().unwrap(), *BOB_DID);
}
