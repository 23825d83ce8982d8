//! SQLite backend behaviour on real database files.

use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use ticktrack::db::Store;
use ticktrack::domain::{Session, SessionToken, TimerState, UserId};
use ticktrack::repository::{RepositoryError, SessionRepository, TimerRepository, UserRepository};
use ticktrack::services::TimerEngine;

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("ticktrack-store-test-{}.db", uuid::Uuid::new_v4()))
}

async fn open(path: &PathBuf) -> Store {
    Store::new(&format!("sqlite:{}", path.display()))
        .await
        .expect("failed to open store")
}

async fn spawn_store() -> Store {
    open(&temp_db_path()).await
}

#[tokio::test]
async fn duplicate_username_is_reported_as_duplicate() {
    let store = spawn_store().await;
    store.create_user("alice", "hash-1").await.expect("create alice");

    let err = store.create_user("alice", "hash-2").await.unwrap_err();
    assert!(matches!(err, RepositoryError::Duplicate(_)));
}

#[tokio::test]
async fn users_survive_reopening_the_database() {
    let path = temp_db_path();

    let created = {
        let store = open(&path).await;
        store.create_user("alice", "hash").await.expect("create")
    };

    let store = open(&path).await;
    let found = store
        .find_user_by_username("alice")
        .await
        .expect("lookup")
        .expect("alice exists");
    assert_eq!(found.id, created.id);
    assert_eq!(
        store.find_user_by_id(created.id).await.unwrap().unwrap().username,
        "alice"
    );
}

#[tokio::test]
async fn sessions_round_trip_and_delete_per_user() {
    let store = spawn_store().await;
    let alice = store.create_user("alice", "h").await.unwrap();
    let bob = store.create_user("bob", "h").await.unwrap();

    let session = |token: &str, user_id: UserId| Session {
        token: SessionToken::new(token),
        user_id,
        created_at: Utc::now(),
    };

    store.insert_session(&session("a1", alice.id)).await.unwrap();
    store.insert_session(&session("a2", alice.id)).await.unwrap();
    store.insert_session(&session("b1", bob.id)).await.unwrap();

    let err = store
        .insert_session(&session("a1", bob.id))
        .await
        .unwrap_err();
    assert!(matches!(err, RepositoryError::Duplicate(_)));

    let found = store
        .find_session(&SessionToken::new("a1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.user_id, alice.id);

    assert_eq!(store.delete_sessions_for_user(alice.id).await.unwrap(), 2);
    assert!(
        store
            .find_session(&SessionToken::new("a2"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .find_session(&SessionToken::new("b1"))
            .await
            .unwrap()
            .is_some()
    );

    store.delete_session(&SessionToken::new("a1")).await.unwrap();
}

#[tokio::test]
async fn timers_list_by_state_in_creation_order() {
    let store = spawn_store().await;
    let owner = store.create_user("alice", "h").await.unwrap().id;
    let now = Utc::now();

    let first = store.insert_timer(owner, "first", now).await.unwrap();
    let second = store.insert_timer(owner, "second", now).await.unwrap();
    let third = store.insert_timer(owner, "third", now).await.unwrap();
    store
        .stop_if_active(second.id, now + Duration::seconds(1))
        .await
        .unwrap();

    let active = store.list_timers(owner, TimerState::Active).await.unwrap();
    let stopped = store.list_timers(owner, TimerState::Stopped).await.unwrap();

    assert_eq!(
        active.iter().map(|t| t.id).collect::<Vec<_>>(),
        vec![first.id, third.id]
    );
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].id, second.id);
    assert_eq!(
        stopped[0].stopped_at.unwrap().timestamp_millis(),
        (now + Duration::seconds(1)).timestamp_millis()
    );
}

#[tokio::test]
async fn conditional_stop_only_writes_once() {
    let store = spawn_store().await;
    let owner = store.create_user("alice", "h").await.unwrap().id;
    let now = Utc::now();
    let timer = store.insert_timer(owner, "task", now).await.unwrap();

    let first = store
        .stop_if_active(timer.id, now + Duration::seconds(2))
        .await
        .unwrap()
        .unwrap();
    let second = store
        .stop_if_active(timer.id, now + Duration::seconds(30))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.state, TimerState::Stopped);
    assert_eq!(first.stopped_at, second.stopped_at);
}

#[tokio::test]
async fn concurrent_engine_stops_agree_on_one_end_time() {
    let store = Arc::new(spawn_store().await);
    let owner = store.create_user("alice", "h").await.unwrap().id;
    let engine = Arc::new(TimerEngine::new(store.clone()));
    let timer = engine.start(owner, "race").await.unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.stop(owner, timer.id).await })
        })
        .collect();

    let mut ends = HashSet::new();
    for handle in handles {
        let stopped = handle.await.unwrap().expect("stop succeeds");
        ends.insert(stopped.stopped_at.expect("stopped_at set"));
    }

    assert_eq!(ends.len(), 1);
    let persisted = store.find_timer(timer.id).await.unwrap().unwrap();
    assert_eq!(persisted.stopped_at, ends.into_iter().next());
}

#[tokio::test]
async fn unknown_timer_is_absent() {
    let store = spawn_store().await;
    let id = ticktrack::domain::TimerId::new(12_345);

    assert!(store.find_timer(id).await.unwrap().is_none());
    assert!(store.stop_if_active(id, Utc::now()).await.unwrap().is_none());
}
