//! Records Delete

use dwn_core::endpoint;
use dwn_core::messages::{self, MessagesFilter};
use dwn_core::provider::KeyStore;
use dwn_core::records::{
    Data, DeleteBuilder, QueryBuilder, ReadBuilder, RecordsFilter, WriteBuilder, WriteProtocol,
};
use dwn_core::protocols::{ConfigureBuilder, Definition};
use dwn_core::{Error, Interface};
use http::StatusCode;
use serde_json::json;
use test_node::key_store::ALICE_DID;
use test_node::provider::ProviderImpl;

// Successfully delete a record and then fail when attempting to delete it
// again.
#[tokio::test]
async fn delete_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a message to her web node.
    // --------------------------------------------------
    let data = serde_json::to_vec(&json!({
        "message": "test record write",
    }))
    .expect("should serialize");

    let write = WriteBuilder::new()
        .data(Data::from(data))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Ensure the record was written.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query.clone(), &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert!(reply.body.is_some());

    // --------------------------------------------------
    // Delete the record.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(&ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Ensure the record no longer appears in query results.
    // --------------------------------------------------
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert!(reply.body.is_none());

    // --------------------------------------------------
    // Deleting the same record again should fail.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let err = endpoint::handle(&ALICE_DID, delete, &provider).await.expect_err("should be 404");
    assert_eq!(
        err.to_json(),
        json!({"code": 404, "detail": "cannot delete a `RecordsDelete` record"})
    );
}

// Reading a deleted record returns the tombstone and initial write with a
// not-found status.
#[tokio::test]
async fn read_deleted_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"soon deleted".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(&ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::NOT_FOUND);

    let entry = reply.body.expect("should have body").entry;
    assert!(entry.records_delete.is_some());
    let initial = entry.initial_write.expect("should have initial write");
    assert_eq!(initial.record_id, write.record_id);
}

// A delete older than the newest record version is rejected as a
// conflict.
#[tokio::test]
async fn delete_older_conflict() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let initial = WriteBuilder::new()
        .data(Data::from(b"version 1".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, initial.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let update = WriteBuilder::from(initial.clone())
        .data(Data::from(b"version 2".to_vec()))
        .message_timestamp(initial.descriptor.base.message_timestamp + chrono::Duration::seconds(2))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, update, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // a delete timestamped between the two versions loses
    let delete = DeleteBuilder::new()
        .record_id(&initial.record_id)
        .message_timestamp(initial.descriptor.base.message_timestamp + chrono::Duration::seconds(1))
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let Err(Error::Conflict(e)) = endpoint::handle(&ALICE_DID, delete, &provider).await else {
        panic!("should be Conflict");
    };
    assert_eq!(e, "newer record version exists");
}

// Deleting a record that does not exist returns not-found.
#[tokio::test]
async fn delete_missing_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let delete = DeleteBuilder::new()
        .record_id("bafyunknown")
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let err = endpoint::handle(&ALICE_DID, delete, &provider).await.expect_err("should be 404");
    assert_eq!(err.to_json(), json!({"code": 404, "detail": "no matching record found"}));
}

// Pruning a record removes the entire descendant subtree: every message
// except the tombstone, while the event log retains the history.
#[tokio::test]
async fn prune_descendants() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice installs a three-level protocol.
    // --------------------------------------------------
    let definition: Definition = serde_json::from_value(json!({
        "protocol": "https://example.com/nested",
        "published": true,
        "types": {
            "foo": {},
            "bar": {},
            "baz": {}
        },
        "structure": {
            "foo": {
                "bar": {
                    "baz": {}
                }
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
    // Alice writes foo, foo/bar, and foo/bar/baz records.
    // --------------------------------------------------
    let foo = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/nested".to_string(),
            protocol_path: "foo".to_string(),
        })
        .data(Data::from(b"foo".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, foo.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let bar = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/nested".to_string(),
            protocol_path: "foo/bar".to_string(),
        })
        .parent_context_id(foo.context_id.clone().unwrap())
        .data(Data::from(b"bar".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, bar.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let baz = WriteBuilder::new()
        .protocol(WriteProtocol {
            protocol: "https://example.com/nested".to_string(),
            protocol_path: "foo/bar/baz".to_string(),
        })
        .parent_context_id(bar.context_id.clone().unwrap())
        .data(Data::from(b"baz".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, baz.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice prunes the root record.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&foo.record_id)
        .prune(true)
        .build(&alice_keyring)
        .await
        .expect("should create delete");
    let reply = endpoint::handle(&ALICE_DID, delete, &provider).await.expect("should delete");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // No record in the subtree remains queryable or readable.
    // --------------------------------------------------
    for record_id in [&foo.record_id, &bar.record_id, &baz.record_id] {
        let read = ReadBuilder::new()
            .filter(RecordsFilter::new().record_id(record_id))
            .build(&alice_keyring)
            .await
            .expect("should create read");
        let result = endpoint::handle(&ALICE_DID, read, &provider).await;
        assert!(result.is_err() || result.unwrap().status.code == StatusCode::NOT_FOUND);
    }

    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().protocol("https://example.com/nested"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert!(reply.body.is_none());

    // --------------------------------------------------
    // The event log retains the three writes plus the delete.
    // --------------------------------------------------
    let events_query = messages::QueryBuilder::new()
        .add_filter(MessagesFilter::new().interface(Interface::Records))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, events_query, &provider).await.expect("should query");
    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 4);
}
