use stash_core::{
    BackendKind, ChunkSession, ChunkSessionState, ContentHash, FileStatus, TransferState,
    TransferTask, UserId,
};
use stash_metadata::models::{Location, LocationUpdate, NewBinding, NewFile, PartMark};
use stash_metadata::repos::{ChunkSessionRepo, FileRepo, TransferQueueRepo, UserFileRepo};
use stash_metadata::{MetadataError, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

async fn open_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("metadata.db"), Some(5))
        .await
        .unwrap();
    (dir, store)
}

fn user(id: i64) -> UserId {
    UserId::new(id).unwrap()
}

fn local_file(content: &[u8]) -> NewFile {
    let hash = ContentHash::compute(content);
    NewFile {
        content_hash: hash,
        size: content.len() as u64,
        storage_backend: BackendKind::Local,
        storage_path: hash.to_hex(),
    }
}

fn binding(user_id: i64, name: &str) -> NewBinding {
    NewBinding {
        user_id: user(user_id),
        display_name: name.to_string(),
        directory_id: None,
    }
}

#[tokio::test]
async fn create_file_rejects_duplicate_hash_without_side_effects() {
    let (_dir, store) = open_store().await;
    let file = local_file(b"same bytes");
    let task = TransferTask::for_local_file(file.content_hash, "files/", BackendKind::S3);

    let (row, bound) = store
        .create_file_with_binding(&file, &binding(1, "a.txt"), Some(&task))
        .await
        .unwrap();
    assert_eq!(row.hash().unwrap(), file.content_hash);
    assert_eq!(bound.file_id, row.file_id);
    assert_eq!(store.count_transfers(TransferState::Pending).await.unwrap(), 1);

    let err = store
        .create_file_with_binding(&file, &binding(2, "b.txt"), Some(&task))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));

    // The losing transaction left no binding for user 2.
    assert_eq!(store.count_user_files(user(2)).await.unwrap(), 0);
    assert_eq!(store.count_file_refs(row.file_id).await.unwrap(), 1);
    assert_eq!(store.count_transfers(TransferState::Pending).await.unwrap(), 1);
}

#[tokio::test]
async fn bind_is_idempotent_per_user_file_and_name() {
    let (_dir, store) = open_store().await;
    let (row, first) = store
        .create_file_with_binding(&local_file(b"x"), &binding(1, "x.bin"), None)
        .await
        .unwrap();

    let (again, created) = store.bind_file(row.file_id, &binding(1, "x.bin")).await.unwrap();
    assert!(!created);
    assert_eq!(again.user_file_id, first.user_file_id);

    let (other, created) = store.bind_file(row.file_id, &binding(1, "copy.bin")).await.unwrap();
    assert!(created);
    assert_ne!(other.user_file_id, first.user_file_id);

    assert_eq!(store.count_file_refs(row.file_id).await.unwrap(), 2);
}

#[tokio::test]
async fn bind_unknown_file_is_not_found() {
    let (_dir, store) = open_store().await;
    let err = store.bind_file(42, &binding(1, "ghost")).await.unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
}

#[tokio::test]
async fn soft_delete_marks_file_reclaimable_only_after_last_binding() {
    let (_dir, store) = open_store().await;
    let (row, a) = store
        .create_file_with_binding(&local_file(b"shared"), &binding(1, "a"), None)
        .await
        .unwrap();
    let (b, _) = store.bind_file(row.file_id, &binding(2, "b")).await.unwrap();

    let outcome = store.soft_delete_user_file(user(1), a.user_file_id).await.unwrap();
    assert!(!outcome.file_orphaned);
    assert!(store.list_reclaimable_files(10).await.unwrap().is_empty());

    let outcome = store.soft_delete_user_file(user(2), b.user_file_id).await.unwrap();
    assert!(outcome.file_orphaned);
    let reclaimable = store.list_reclaimable_files(10).await.unwrap();
    assert_eq!(reclaimable.len(), 1);
    assert_eq!(reclaimable[0].file_id, row.file_id);

    // Deleting twice is NotFound; the binding is gone from the user's view.
    let err = store
        .soft_delete_user_file(user(2), b.user_file_id)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));
    assert!(
        store
            .get_user_file(user(2), b.user_file_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn rebinding_revives_a_file_awaiting_reclaim() {
    let (_dir, store) = open_store().await;
    let (row, a) = store
        .create_file_with_binding(&local_file(b"revive"), &binding(1, "a"), None)
        .await
        .unwrap();
    store.soft_delete_user_file(user(1), a.user_file_id).await.unwrap();

    let (_, created) = store.bind_file(row.file_id, &binding(1, "a")).await.unwrap();
    assert!(created);
    assert!(store.list_reclaimable_files(10).await.unwrap().is_empty());
    assert!(!store.delete_file_if_unreferenced(row.file_id).await.unwrap());

    let file = store.get_file(row.file_id).await.unwrap().unwrap();
    assert!(file.deleted_at.is_none());
}

#[tokio::test]
async fn delete_file_if_unreferenced_drops_row_and_tasks() {
    let (_dir, store) = open_store().await;
    let file = local_file(b"gone");
    let task = TransferTask::for_local_file(file.content_hash, "", BackendKind::S3);
    let (row, a) = store
        .create_file_with_binding(&file, &binding(1, "gone"), Some(&task))
        .await
        .unwrap();

    // Live binding blocks reclaim.
    assert!(!store.delete_file_if_unreferenced(row.file_id).await.unwrap());

    store.soft_delete_user_file(user(1), a.user_file_id).await.unwrap();
    assert!(store.delete_file_if_unreferenced(row.file_id).await.unwrap());
    assert!(store.get_file(row.file_id).await.unwrap().is_none());
    assert_eq!(store.count_transfers(TransferState::Pending).await.unwrap(), 0);
}

#[tokio::test]
async fn rename_respects_uniqueness_and_locks() {
    let (_dir, store) = open_store().await;
    let (row, a) = store
        .create_file_with_binding(&local_file(b"r"), &binding(1, "one"), None)
        .await
        .unwrap();
    let (b, _) = store.bind_file(row.file_id, &binding(1, "two")).await.unwrap();

    let view = store
        .rename_user_file(user(1), a.user_file_id, "three")
        .await
        .unwrap();
    assert_eq!(view.display_name, "three");
    assert_eq!(view.hash().unwrap(), ContentHash::compute(b"r"));

    let err = store
        .rename_user_file(user(1), a.user_file_id, "two")
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));

    // Another user cannot touch the binding.
    let err = store
        .rename_user_file(user(9), a.user_file_id, "mine")
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::NotFound(_)));

    store
        .set_user_file_status(b.user_file_id, FileStatus::Locked)
        .await
        .unwrap();
    let err = store
        .rename_user_file(user(1), b.user_file_id, "four")
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));
    let err = store
        .soft_delete_user_file(user(1), b.user_file_id)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn list_user_files_is_scoped_and_paginated() {
    let (_dir, store) = open_store().await;
    for i in 0..5u8 {
        store
            .create_file_with_binding(&local_file(&[i]), &binding(1, &format!("f{i}")), None)
            .await
            .unwrap();
    }
    store
        .create_file_with_binding(&local_file(b"other"), &binding(2, "other"), None)
        .await
        .unwrap();

    let page = store.list_user_files(user(1), 2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].display_name, "f4");
    let rest = store.list_user_files(user(1), 10, 2).await.unwrap();
    assert_eq!(rest.len(), 3);
    assert!(rest.iter().all(|v| v.user_id == 1));
    assert_eq!(store.count_user_files(user(1)).await.unwrap(), 5);
}

#[tokio::test]
async fn location_update_is_compare_and_set() {
    let (_dir, store) = open_store().await;
    let file = local_file(b"move me");
    store
        .create_file_with_binding(&file, &binding(1, "m"), None)
        .await
        .unwrap();

    let from = Location::new(BackendKind::Local, file.content_hash.to_hex());
    let to = Location::new(BackendKind::S3, format!("files/{}", file.content_hash));

    assert_eq!(
        store
            .update_file_location(&file.content_hash, &from, &to)
            .await
            .unwrap(),
        LocationUpdate::Moved
    );
    assert_eq!(
        store
            .update_file_location(&file.content_hash, &from, &to)
            .await
            .unwrap(),
        LocationUpdate::AlreadyAtDestination
    );

    let elsewhere = Location::new(BackendKind::Cos, "x");
    let err = store
        .update_file_location(&file.content_hash, &from, &elsewhere)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::Conflict(_)));

    let row = store
        .find_file_by_hash(&file.content_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.backend().unwrap(), BackendKind::S3);
}

fn session(total: u64, chunk: u64) -> ChunkSession {
    ChunkSession::new(
        user(1),
        ContentHash::compute(b"session"),
        total,
        chunk,
        Duration::hours(1),
    )
    .unwrap()
}

#[tokio::test]
async fn chunk_parts_are_tracked_per_index() {
    let (_dir, store) = open_store().await;
    let s = session(10, 4);
    store.create_chunk_session(&s).await.unwrap();

    let now = OffsetDateTime::now_utc();
    let later = now + Duration::hours(2);
    assert_eq!(
        store.mark_chunk_received(s.upload_id, 2, now, later).await.unwrap(),
        PartMark::Inserted
    );
    assert_eq!(
        store.mark_chunk_received(s.upload_id, 2, now, later).await.unwrap(),
        PartMark::Replaced
    );
    store.mark_chunk_received(s.upload_id, 0, now, later).await.unwrap();

    assert_eq!(store.received_chunk_indices(s.upload_id).await.unwrap(), vec![0, 2]);

    let loaded = store.get_chunk_session(s.upload_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, ChunkSessionState::Receiving);
    assert_eq!(loaded.chunk_count, 3);
    assert!(loaded.expires_at > s.expires_at);
}

#[tokio::test]
async fn concurrent_part_marks_are_not_lost() {
    let (_dir, store) = open_store().await;
    let store = Arc::new(store);
    let s = session(64, 1);
    store.create_chunk_session(&s).await.unwrap();

    let mut handles = Vec::new();
    for index in 0..64u64 {
        let store = store.clone();
        let upload_id = s.upload_id;
        handles.push(tokio::spawn(async move {
            let now = OffsetDateTime::now_utc();
            store
                .mark_chunk_received(upload_id, index, now, now + Duration::hours(1))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let received = store.received_chunk_indices(s.upload_id).await.unwrap();
    assert_eq!(received, (0..64).collect::<Vec<_>>());
}

#[tokio::test]
async fn completing_blocks_parts_and_second_completion() {
    let (_dir, store) = open_store().await;
    let s = session(4, 4);
    store.create_chunk_session(&s).await.unwrap();
    let now = OffsetDateTime::now_utc();
    let later = now + Duration::hours(1);

    assert!(store.begin_completing(s.upload_id, now, later).await.unwrap());
    assert!(!store.begin_completing(s.upload_id, now, later).await.unwrap());

    let err = store
        .mark_chunk_received(s.upload_id, 0, now, later)
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));

    store.abort_completing(s.upload_id, now).await.unwrap();
    store.mark_chunk_received(s.upload_id, 0, now, later).await.unwrap();

    store.delete_chunk_session(s.upload_id).await.unwrap();
    assert!(store.get_chunk_session(s.upload_id).await.unwrap().is_none());
    assert!(store.received_chunk_indices(s.upload_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn expired_sessions_are_listed_and_conditionally_deleted() {
    let (_dir, store) = open_store().await;
    let s = session(8, 4);
    store.create_chunk_session(&s).await.unwrap();

    let before_expiry = s.expires_at - Duration::minutes(1);
    assert!(
        store
            .list_expired_chunk_sessions(before_expiry, 10)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        !store
            .delete_chunk_session_if_expired(s.upload_id, before_expiry)
            .await
            .unwrap()
    );

    let after_expiry = s.expires_at + Duration::minutes(1);
    let expired = store.list_expired_chunk_sessions(after_expiry, 10).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].upload_id, s.upload_id);
    assert!(
        store
            .delete_chunk_session_if_expired(s.upload_id, after_expiry)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn transfer_queue_lease_retry_and_dead_letter() {
    let (_dir, store) = open_store().await;
    let hash = ContentHash::compute(b"queued");
    let task = TransferTask::for_local_file(hash, "files", BackendKind::S3);
    let now = OffsetDateTime::now_utc();

    assert!(store.enqueue_transfer(&task, now).await.unwrap());
    assert!(!store.enqueue_transfer(&task, now).await.unwrap());

    let lease_until = now + Duration::minutes(10);
    let claimed = store
        .claim_next_transfer(now, lease_until)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts, 1);
    assert_eq!(claimed.task, task);
    assert_eq!(claimed.state, TransferState::Leased);

    // Leased and not expired: nothing else to claim.
    assert!(store.claim_next_transfer(now, lease_until).await.unwrap().is_none());

    // An expired lease is claimable again.
    let reclaimed = store
        .claim_next_transfer(lease_until, lease_until + Duration::minutes(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reclaimed.task_id, claimed.task_id);
    assert_eq!(reclaimed.attempts, 2);

    let retry_at = now + Duration::seconds(30);
    store
        .nack_transfer(reclaimed.task_id, "boom", retry_at)
        .await
        .unwrap();
    assert!(store.claim_next_transfer(now, lease_until).await.unwrap().is_none());
    let retried = store
        .claim_next_transfer(retry_at, retry_at + Duration::minutes(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(retried.attempts, 3);

    store
        .dead_letter_transfer(retried.task_id, "gave up", retry_at)
        .await
        .unwrap();
    assert_eq!(store.count_transfers(TransferState::Dead).await.unwrap(), 1);
    let dead = store.list_dead_transfers(10).await.unwrap();
    assert_eq!(dead[0].last_error.as_deref(), Some("gave up"));

    let later = retry_at + Duration::minutes(5);
    assert!(store.requeue_dead_transfer(retried.task_id, later).await.unwrap());
    assert!(!store.requeue_dead_transfer(retried.task_id, later).await.unwrap());
    let fresh = store
        .claim_next_transfer(later, later + Duration::minutes(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.attempts, 1);

    store.ack_transfer(fresh.task_id).await.unwrap();
    assert_eq!(store.count_transfers(TransferState::Pending).await.unwrap(), 0);
    assert_eq!(store.count_transfers(TransferState::Leased).await.unwrap(), 0);
}
