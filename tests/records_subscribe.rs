//! Records Subscribe

use dwn_core::endpoint;
use dwn_core::provider::KeyStore;
use dwn_core::records::{Data, RecordsFilter, SubscribeBuilder, WriteBuilder};
use futures::StreamExt;
use http::StatusCode;
use test_node::key_store::ALICE_DID;
use test_node::provider::ProviderImpl;

// A subscription delivers matching record events in write order and
// filters out the rest.
#[tokio::test]
async fn filtered_subscription() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice subscribes to records with a specific schema.
    // --------------------------------------------------
    let subscribe = SubscribeBuilder::new()
        .filter(RecordsFilter::new().schema("https://example.com/note"))
        .build(&alice_keyring)
        .await
        .expect("should build");
    let reply = endpoint::handle(&ALICE_DID, subscribe, &provider).await.expect("should subscribe");
    assert_eq!(reply.status.code, StatusCode::OK);

    let mut subscription = reply.body.expect("should have body").subscription;

    // --------------------------------------------------
    // Alice writes one matching and one non-matching record.
    // --------------------------------------------------
    let matching = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"matching".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, matching.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    let other = WriteBuilder::new()
        .schema("https://example.com/other")
        .data(Data::from(b"other".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, other, &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // a third matching write confirms ordering
    let second = WriteBuilder::new()
        .schema("https://example.com/note")
        .data(Data::from(b"second".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply =
        endpoint::handle(&ALICE_DID, second.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // Only the matching events are delivered, in emit order.
    // --------------------------------------------------
    let event = subscription.next().await.expect("should receive event");
    assert_eq!(
        event.as_write().expect("should be write").record_id,
        matching.record_id
    );

    let event = subscription.next().await.expect("should receive event");
    assert_eq!(event.as_write().expect("should be write").record_id, second.record_id);

    // --------------------------------------------------
    // Closing the subscription stops delivery.
    // --------------------------------------------------
    subscription.close();
    assert!(subscription.next().await.is_none());
}
