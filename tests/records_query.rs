//! Records Query

use chrono::{Duration, Utc};
use dwn_core::endpoint;
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, QueryBuilder, RecordsFilter, Sort, WriteBuilder};
use dwn_core::store::Pagination;
use http::StatusCode;
use test_node::key_store::{ALICE_DID, BOB_DID, CAROL_DID};
use test_node::provider::ProviderImpl;

// The owner sees every record regardless of publication state.
#[tokio::test]
async fn owner_sees_all() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes one published and one private record.
    // --------------------------------------------------
    let published = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"published note".to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, published, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let private = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"private note".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, private, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Alice's query returns both records.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert_eq!(reply.status.code, StatusCode::OK);

    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 2);
}

// An anonymous query returns published records only.
#[tokio::test]
async fn anonymous_sees_published() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    let published = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"published note".to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, published.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let private = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"private note".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, private, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .anonymous()
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].write.record_id, published.record_id);
}

// A non-owner viewer sees the union of published records and unpublished
// records addressed to them.
#[tokio::test]
async fn non_owner_union() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");
    let bob_keyring = provider.keyring(&BOB_DID).expect("should get Bob's keyring");

    // --------------------------------------------------
    // Alice writes a published record, a record addressed to Bob, and a
    // private record.
    // --------------------------------------------------
    let published = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"published".to_vec()))
        .published(true)
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, published.clone(), &provider).await.expect("should write");

    let for_bob = WriteBuilder::new()
        .schema("https://example.com/note")
        .recipient(BOB_DID.as_str())
        .data(Data::from(b"for bob".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, for_bob.clone(), &provider).await.expect("should write");

    let private = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"private".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    endpoint::handle(&ALICE_DID, private, &provider).await.expect("should write");

    // --------------------------------------------------
    // Bob sees the published record and the one addressed to him.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .build(&bob_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query.clone(), &provider).await.expect("should query");

    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    let mut record_ids: Vec<String> =
        entries.iter().map(|entry| entry.write.record_id.clone()).collect();
    record_ids.sort();
    let mut expected = vec![published.record_id, for_bob.record_id];
    expected.sort();
    assert_eq!(record_ids, expected);

    // --------------------------------------------------
    // Carol sees the published record alone.
    // --------------------------------------------------
    let carol_keyring = provider.keyring(&CAROL_DID).expect("should get Carol's keyring");
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .build(&carol_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

    let entries = reply.body.expect("should have body").entries.expect("should have entries");
    assert_eq!(entries.len(), 1);
}

// Query results are sorted and paginated with an opaque cursor.
#[tokio::test]
async fn sort_and_paginate() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Write five records with increasing creation dates.
    // --------------------------------------------------
    let base_time = Utc::now() - Duration::minutes(5);
    let mut record_ids = Vec::new();

    for i in 0..5_i64 {
        let write = WriteBuilder::new()
            .schema("https://example.com/note")
            .data(Data::from(format!("note {i}").into_bytes()))
            .message_timestamp(base_time + Duration::seconds(i))
            .build(&alice_keyring)
            .await
            .expect("should create write");
        let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider)
            .await
            .expect("should write");
        assert_eq!(reply.status.code, StatusCode::ACCEPTED);
        record_ids.push(write.record_id);
    }

    // --------------------------------------------------
    // Page through the records oldest-first, two at a time.
    // --------------------------------------------------
    let mut fetched = Vec::new();
    let mut cursor = None;

    loop {
        let mut pagination = Pagination::new(2);
        if let Some(cursor) = cursor.take() {
            pagination = pagination.cursor(cursor);
        }
        let query = QueryBuilder::new()
            .filter(RecordsFilter::new().schema("https://example.com/note"))
            .date_sort(Sort::CreatedAsc)
            .pagination(pagination)
            .build(&alice_keyring)
            .await
            .expect("should create query");
        let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");

        let Some(body) = reply.body else {
            break;
        };
        for entry in body.entries.unwrap_or_default() {
            fetched.push(entry.write.record_id);
        }
        cursor = body.cursor;
        if cursor.is_none() {
            break;
        }
    }

    assert_eq!(fetched, record_ids);
}
