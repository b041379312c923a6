//! Resumable Tasks

use dwn_core::endpoint;
use dwn_core::provider::{KeyStore, TaskStore};
use dwn_core::records::{Data, DeleteBuilder, QueryBuilder, RecordsFilter, WriteBuilder};
use dwn_core::tasks::{self, ResumableTask, TaskType};
use http::StatusCode;
use test_node::key_store::ALICE_DID;
use test_node::provider::ProviderImpl;

// A delete task abandoned before execution is picked up and completed by
// the startup resume sweep.
#[tokio::test]
async fn resume_abandoned_delete() {
    let provider = ProviderImpl::new().await.expect("should create provider");
    let alice_keyring = provider.keyring(&ALICE_DID).expect("should get Alice's keyring");

    // --------------------------------------------------
    // Alice writes a record.
    // --------------------------------------------------
    let write = WriteBuilder::new()
        .data(Data::from(b"doomed record".to_vec()))
        .build(&alice_keyring)
        .await
        .expect("should create write");
    let reply = endpoint::handle(&ALICE_DID, write.clone(), &provider).await.expect("should write");
    assert_eq!(reply.status.code, StatusCode::ACCEPTED);

    // --------------------------------------------------
    // A delete is registered as a task whose lease has already lapsed —
    // as if the node crashed before executing it.
    // --------------------------------------------------
    let delete = DeleteBuilder::new()
        .record_id(&write.record_id)
        .build(&alice_keyring)
        .await
        .expect("should create delete");

    let abandoned = ResumableTask {
        id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
        task: TaskType::RecordsDelete(delete),
    };
    TaskStore::register(&provider, &ALICE_DID, &abandoned, 0)
        .await
        .expect("should register");

    // --------------------------------------------------
    // The record is still live: the task never ran.
    // --------------------------------------------------
    let query = QueryBuilder::new()
        .filter(RecordsFilter::new().record_id(&write.record_id))
        .build(&alice_keyring)
        .await
        .expect("should create query");
    let reply = endpoint::handle(&ALICE_DID, query.clone(), &provider).await.expect("should query");
    assert!(reply.body.is_some());

    // --------------------------------------------------
    // The startup sweep runs the task to completion and deletes it.
    // --------------------------------------------------
    tasks::resume(&ALICE_DID, &provider).await.expect("should resume");

    let reply = endpoint::handle(&ALICE_DID, query, &provider).await.expect("should query");
    assert!(reply.body.is_none());

    let task = TaskStore::read(&provider, &ALICE_DID, &abandoned.id).await.expect("should read");
    assert!(task.is_none());
}
