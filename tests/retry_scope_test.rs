//! Contention classification and retry behavior against real SQLite locks.

use sqlsession::{
    scope, ConnectionTarget, DialectFamily, Engine, PoolPolicy, RetryPolicy, SessionOptions,
    SqlValue,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn contended_target(dir: &TempDir) -> ConnectionTarget {
    // Two connections so two sessions can race for the write lock.
    ConnectionTarget::sqlite(dir.path().join("test.db").to_string_lossy().into_owned()).with_pool(
        PoolPolicy {
            pool_size: Some(2),
            max_overflow: Some(0),
            ..PoolPolicy::default()
        },
    )
}

async fn started_engine(dir: &TempDir) -> Engine {
    let engine = Engine::new(contended_target(dir)).unwrap();
    engine.start().await.unwrap();
    let mut session = engine.get_session().await.unwrap();
    session
        .execute(
            "CREATE TABLE IF NOT EXISTS counters (id INTEGER PRIMARY KEY, n INTEGER NOT NULL)",
            &[],
        )
        .await
        .unwrap();
    session.commit().await.unwrap();
    session.close().await;
    engine
}

#[tokio::test]
async fn test_write_lock_conflict_classified_as_contention() {
    let dir = TempDir::new().unwrap();
    let engine = started_engine(&dir).await;

    // Holder takes the write lock and keeps its transaction open.
    let mut holder = engine.get_session().await.unwrap();
    holder
        .execute("INSERT INTO counters (n) VALUES (?)", &[SqlValue::Int(1)])
        .await
        .unwrap();

    // The second writer gives up after a 50ms busy timeout.
    let mut blocked = engine
        .get_session_with(&SessionOptions::with_timeout(0.05))
        .await
        .unwrap();
    let err = blocked
        .execute("INSERT INTO counters (n) VALUES (?)", &[SqlValue::Int(2)])
        .await
        .unwrap_err();

    assert!(err.is_contention(), "expected contention, got {err:?}");
    let fault = err.fault().expect("driver fault attached");
    assert_eq!(fault.family, DialectFamily::Sqlite);

    blocked.close().await;
    holder.rollback().await.unwrap();
    holder.close().await;
    engine.stop().await;
}

#[tokio::test]
async fn test_retrying_succeeds_once_lock_is_released() {
    let dir = TempDir::new().unwrap();
    let engine = Arc::new(started_engine(&dir).await);

    let mut holder = engine.get_session().await.unwrap();
    holder
        .execute("INSERT INTO counters (n) VALUES (?)", &[SqlValue::Int(1)])
        .await
        .unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let writer = {
        let engine = Arc::clone(&engine);
        let attempts = Arc::clone(&attempts);
        tokio::spawn(async move {
            let policy = RetryPolicy::new(10, Duration::from_millis(100), 1.0)
                .unwrap()
                .contention_only();
            let opts = SessionOptions::with_timeout(0.05);
            scope::retrying(&engine, &policy, opts, move |session| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    session
                        .execute("INSERT INTO counters (n) VALUES (?)", &[SqlValue::Int(2)])
                        .await?;
                    Ok(())
                })
            })
            .await
        })
    };

    // Keep the lock long enough that at least one attempt fails.
    tokio::time::sleep(Duration::from_millis(300)).await;
    holder.commit().await.unwrap();
    holder.close().await;

    writer.await.unwrap().unwrap();
    assert!(attempts.load(Ordering::SeqCst) >= 2);

    let count = scope::read_only(engine.as_ref(), |session| {
        Box::pin(async move {
            session
                .fetch_scalar_i64("SELECT COUNT(*) FROM counters", &[])
                .await
        })
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(count, 2);
    engine.stop().await;
}

#[tokio::test]
async fn test_contention_only_policy_does_not_retry_plain_errors() {
    let dir = TempDir::new().unwrap();
    let engine = started_engine(&dir).await;

    let policy = RetryPolicy::new(5, Duration::from_millis(1), 1.0)
        .unwrap()
        .contention_only();
    let attempts = AtomicU32::new(0);

    let err = scope::retrying::<(), _>(&engine, &policy, SessionOptions::default(), |session| {
        attempts.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            session.execute("SELECT * FROM no_such_table", &[]).await?;
            Ok(())
        })
    })
    .await
    .unwrap_err();

    assert!(!err.is_contention());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    engine.stop().await;
}
