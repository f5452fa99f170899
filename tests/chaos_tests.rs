// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos Tests for the Sync Coordinator
//!
//! Failure injection: dropped replication connections, refused reconnects,
//! corrupt frames, target constraint violations, unusable storage. Each test
//! checks that no committed change is lost or applied out of order, and that
//! unrecoverable faults halt the coordinator instead of skipping data.
//!
//! # Running Tests
//! ```bash
//! cargo test --test chaos_tests
//! ```

mod common;

use bytes::Bytes;
use common::{batch_id, config_at, coordinator, wait_for_checkpoint, wait_until, Frames, USERS};
use std::sync::Arc;
use std::time::Duration;
use table_sync::{
    CheckpointStore, CoordinatorState, FrameLog, Lsn, MemoryTarget, SyncCoordinator, SyncError,
    TargetError,
};
use tempfile::TempDir;

async fn wait_for_state(
    rx: &mut tokio::sync::watch::Receiver<CoordinatorState>,
    state: CoordinatorState,
) {
    tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", state))
        .expect("coordinator dropped");
}

// =============================================================================
// Connection loss
// =============================================================================

#[tokio::test]
async fn reconnect_after_connection_drop_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let mut f = Frames::new();
    let log = FrameLog::new();
    log.append(f.relation());
    log.extend(f.transaction(7, 0x2000, &[("1", "a")]));

    let target = Arc::new(MemoryTarget::new());
    let (mut coordinator, _clock) =
        coordinator(config_at("users", &dir.path().join("c.db")), &log, target.clone());
    let mut checkpoints = coordinator.checkpoint_receiver();
    coordinator.start().await.unwrap();
    wait_for_checkpoint(&mut checkpoints, 0x2000).await;

    log.disconnect();
    log.extend(f.transaction(8, 0x2100, &[("2", "b")]));
    wait_for_checkpoint(&mut checkpoints, 0x2100).await;

    assert_eq!(
        target.applied_batches().await,
        vec![batch_id(7, 0x2000), batch_id(8, 0x2100)]
    );
    assert_eq!(log.connect_count(), 2);
    assert_eq!(coordinator.status().reconnects, 1);
    assert!(coordinator.is_running());
    coordinator.stop().await;
}

#[tokio::test]
async fn reconnect_mid_transaction_discards_partial_events() {
    let dir = TempDir::new().unwrap();
    let mut f = Frames::new();
    let log = FrameLog::new();
    log.append(f.relation());
    log.extend([f.begin(0x2000, 7), f.insert("1", "a")]);

    let target = Arc::new(MemoryTarget::new());
    let (mut coordinator, _clock) =
        coordinator(config_at("users", &dir.path().join("c.db")), &log, target.clone());
    let mut checkpoints = coordinator.checkpoint_receiver();
    coordinator.start().await.unwrap();

    // Let the reader see the open transaction, then cut the connection. The
    // fresh connection replays the whole log, so the transaction arrives
    // again in full.
    tokio::time::sleep(Duration::from_millis(50)).await;
    log.disconnect();
    log.extend([f.insert("2", "b"), f.commit(0x2000)]);
    wait_for_checkpoint(&mut checkpoints, 0x2000).await;

    assert_eq!(target.applied_batches().await, vec![batch_id(7, 0x2000)]);
    assert_eq!(target.row_count(USERS).await, 2);
    assert_eq!(coordinator.status().events_applied, 2);
    coordinator.stop().await;
}

#[tokio::test]
async fn reconnect_retries_refused_connections() {
    let dir = TempDir::new().unwrap();
    let mut f = Frames::new();
    let log = FrameLog::new();
    log.append(f.relation());
    log.extend(f.transaction(7, 0x2000, &[("1", "a")]));

    let target = Arc::new(MemoryTarget::new());
    let (mut coordinator, clock) =
        coordinator(config_at("users", &dir.path().join("c.db")), &log, target.clone());
    let mut checkpoints = coordinator.checkpoint_receiver();
    coordinator.start().await.unwrap();
    wait_for_checkpoint(&mut checkpoints, 0x2000).await;

    log.refuse_connects(2);
    log.disconnect();
    log.extend(f.transaction(8, 0x2100, &[("2", "b")]));
    wait_for_checkpoint(&mut checkpoints, 0x2100).await;

    assert_eq!(clock.sleeps().len(), 2);
    assert_eq!(log.connect_count(), 2);
    assert!(coordinator.is_running());
    coordinator.stop().await;
}

#[tokio::test]
async fn reconnect_gives_up_and_fails() {
    let dir = TempDir::new().unwrap();
    let log = FrameLog::new();
    let (mut coordinator, _clock) = coordinator(
        config_at("users", &dir.path().join("c.db")),
        &log,
        Arc::new(MemoryTarget::new()),
    );
    let mut state = coordinator.state_receiver();
    coordinator.start().await.unwrap();

    log.refuse_connects(usize::MAX);
    log.disconnect();
    wait_for_state(&mut state, CoordinatorState::Failed).await;

    let status = coordinator.status();
    assert!(!status.healthy);
    assert!(status.last_error.unwrap().contains("connection refused"));
    coordinator.stop().await;
}

// =============================================================================
// Fatal faults
// =============================================================================

#[tokio::test]
async fn corrupt_frame_halts_without_advancing() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("c.db");
    let mut f = Frames::new();
    let log = FrameLog::new();
    log.append(f.relation());
    log.extend(f.transaction(7, 0x2000, &[("1", "a")]));

    let target = Arc::new(MemoryTarget::new());
    let (mut coordinator, _clock) = coordinator(config_at("users", &db), &log, target.clone());
    let mut checkpoints = coordinator.checkpoint_receiver();
    let mut state = coordinator.state_receiver();
    coordinator.start().await.unwrap();
    wait_for_checkpoint(&mut checkpoints, 0x2000).await;

    log.append(Bytes::from_static(b"w\x00\x00\x00\x00\x00\x00\x30\x00"));
    log.extend(f.transaction(8, 0x2100, &[("2", "b")]));
    wait_for_state(&mut state, CoordinatorState::Failed).await;

    let status = coordinator.status();
    assert_eq!(status.checkpoint_lsn, Some(Lsn(0x2000)));
    assert!(status.last_error.is_some());
    assert!(!coordinator.health_check().await.healthy);
    assert!(target.row(USERS, &["2"]).await.is_none());

    coordinator.stop().await;
    assert!(coordinator.status().last_error.is_some());

    let store = CheckpointStore::open(&db, "users").await.unwrap();
    assert_eq!(store.read().await.unwrap().unwrap().lsn, Lsn(0x2000));
}

#[tokio::test]
async fn constraint_violation_halts_without_advancing() {
    let dir = TempDir::new().unwrap();
    let mut f = Frames::new();
    let log = FrameLog::new();
    log.append(f.relation());
    log.extend(f.transaction(7, 0x2000, &[("1", "a")]));

    // Target has no "name" column.
    let target = Arc::new(MemoryTarget::new().with_table(USERS, &["id"]));
    let (mut coordinator, _clock) =
        coordinator(config_at("users", &dir.path().join("c.db")), &log, target.clone());
    let mut state = coordinator.state_receiver();
    coordinator.start().await.unwrap();
    wait_for_state(&mut state, CoordinatorState::Failed).await;

    assert_eq!(target.call_count(), 1);
    let status = coordinator.status();
    assert_eq!(status.checkpoint_lsn, None);
    assert!(status.last_error.unwrap().contains("name"));
    assert_eq!(status.dead_letter_count, 0);
    coordinator.stop().await;
}

#[tokio::test]
async fn unusable_checkpoint_path_fails_start() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("missing").join("nested").join("c.db");
    let log = FrameLog::new();
    let (mut coordinator, _clock) =
        coordinator(config_at("users", &db), &log, Arc::new(MemoryTarget::new()));

    let err = coordinator.start().await.unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)));
    assert!(err.is_fatal());
    assert_eq!(coordinator.state(), CoordinatorState::Failed);
    assert_eq!(log.connect_count(), 0);
}

#[tokio::test]
async fn stop_during_backoff_aborts_batch_and_keeps_checkpoint() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("c.db");
    let mut f = Frames::new();
    let log = FrameLog::new();
    log.append(f.relation());
    log.extend(f.transaction(7, 0x2000, &[("1", "a")]));

    let target = Arc::new(MemoryTarget::new());
    target
        .fail_next(2, TargetError::Transient("lock timeout".into()))
        .await;

    // Real clock with a long backoff, so stop() lands in the wait.
    let mut config = config_at("users", &db);
    config.settings.apply.initial_backoff = "30s".into();
    config.settings.apply.max_backoff = "30s".into();
    let mut coordinator = SyncCoordinator::new(config, Arc::new(log.clone()), target.clone());
    coordinator.start().await.unwrap();

    let watched = target.clone();
    wait_until("first apply attempt", || {
        let watched = watched.clone();
        async move { watched.call_count() >= 1 }
    })
    .await;

    tokio::time::timeout(Duration::from_secs(5), coordinator.stop())
        .await
        .expect("stop should not wait out the backoff");

    assert_eq!(coordinator.state(), CoordinatorState::Stopped);
    assert_eq!(target.call_count(), 1);
    assert!(coordinator.dead_letters().await.unwrap().is_empty());
    let store = CheckpointStore::open(&db, "users").await.unwrap();
    assert!(store.read().await.unwrap().is_none());
}
