//! Records Read

use dwn_core::endpoint;
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, ReadBuilder, RecordsFilter, WriteBuilder};
use dwn_core::Error;
use http::StatusCode;
use test_node::key_store::{ALICE_DID, BOB_DID, CAROL_DID};
use test_node::provider::ProviderImpl;

// The owner reads their own unpublished record with its payload.
#[tokio::test]
async fn owner_reads_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"owner data".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    let entry = reply.body.expect("should have body").entry;
    let returned = entry.records_write.expect("should have write");
    assert_eq!(returned.record_id, write.record_id);
    assert_eq!(entry.data.expect("should have data").as_bytes(), b"owner data");
}

// The record's recipient can read it; an unrelated viewer cannot.
#[tokio::test]
async fn recipient_reads_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");

    // --------------------------------------------------
    // Alice writes a record addressed to Bob.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .recipient(BOB_DID.as_str())
        .data(Data::from(b"for bob's eyes".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Bob reads the record.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&bob_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);

    // --------------------------------------------------
    // Carol is refused.
    // --------------------------------------------------
    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&carol_keyring)
        .await
        .expect("should create read");
    let Err(Error::Forbidden(_)) = endpoint::handle(&ALICE_DID, read, &provider).await else {
        panic!("should be Forbidden");
    };
}

// Anyone, authenticated or not, can read a published record.
#[tokio::test]
async fn anonymous_reads_published() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let write = WriteBuilder::new()
        .data(Data::from(b"read all about it".to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .anonymous()
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let reply = endpoint::handle(&ALICE_DID, read, &provider).await.expect("should read");
    assert_eq!(reply.status.code, StatusCode::OK);
    assert_eq!(
        reply.body.expect("should have body").entry.data.expect("should have data").as_bytes(),
        b"read all about it"
    );
}

// Reading a record that does not exist returns not-found.
#[tokio::test]
async fn read_missing_record() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let read = ReadBuilder::new()
        .filter(RecordsFilter::new().record_id("bafyunknown"))
        .build(&alice_keyring)
        .await
        .expect("should create read");
    let Err(Error::NotFound(_)) = endpoint::handle(&ALICE_DID, read, &provider).await else {
        panic!("should be NotFound");
    };
}
