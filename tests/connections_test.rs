//! Tests for connection pool management.

use std::sync::Arc;

use im_core::ipc::{ConnectionConfig, ConnectionPool};

#[test]
fn test_acquire_up_to_limit() {
    let pool = ConnectionPool::new(ConnectionConfig { max_connections: 2 });

    let first = pool.try_acquire_owned();
    let second = pool.try_acquire_owned();
    assert!(first.is_some() && second.is_some());
    assert_eq!(pool.active_count(), 2);

    assert!(pool.try_acquire_owned().is_none());
    assert_eq!(pool.active_count(), 2);
}

#[test]
fn test_slot_released_on_drop() {
    let pool = ConnectionPool::new(ConnectionConfig { max_connections: 1 });

    let slot = pool.try_acquire_owned();
    assert!(pool.try_acquire_owned().is_none());
    drop(slot);

    assert_eq!(pool.active_count(), 0);
    assert!(pool.try_acquire_owned().is_some());
}

#[test]
fn test_default_limit() {
    let pool = ConnectionPool::new(ConnectionConfig::default());
    assert_eq!(pool.max_connections(), 256);
}

#[tokio::test]
async fn test_slots_move_across_tasks() {
    let pool = Arc::new(ConnectionPool::new(ConnectionConfig { max_connections: 4 }));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let slot = pool.try_acquire_owned().unwrap();
        tasks.push(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            drop(slot);
        }));
    }
    assert!(pool.try_acquire_owned().is_none());

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(pool.active_count(), 0);
}
