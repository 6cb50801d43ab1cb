//! 需要真实 Postgres：`DATABASE_URL=postgres://... cargo test -- --ignored`
#![cfg(feature = "postgres")]

use anyhow::Result as AnyResult;
use audit_trail::AuditEvent;
use audit_trail::store::{BackingStore, SqlBackingStore, SqlStoreConfig};
use prometheus::Registry;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

async fn pool() -> AnyResult<PgPool> {
    let url = std::env::var("DATABASE_URL")?;
    Ok(PgPoolOptions::new().max_connections(4).connect(&url).await?)
}

async fn fresh_store(pool: &PgPool, table: &str, config: SqlStoreConfig) -> AnyResult<SqlBackingStore> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(pool)
        .await?;
    let config = SqlStoreConfig {
        table_name: Some(table.to_string()),
        ..config
    };
    Ok(SqlBackingStore::init(config, pool.clone(), &Registry::new()).await?)
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn sql_store_is_fifo_and_batched() -> AnyResult<()> {
    let pool = pool().await?;
    let store = fresh_store(
        &pool,
        "audit_events_fifo_test",
        SqlStoreConfig {
            batch_size: Some(2),
            ..Default::default()
        },
    )
    .await?;

    for id in ["e1", "e2", "e3"] {
        store.write(&AuditEvent::new(id).with_field("action", "delete")).await?;
    }

    let first = store.read_batch().await?.expect("batch");
    let ids: Vec<&str> = first.events().iter().map(|e| e.id()).collect();
    assert_eq!(ids, vec!["e1", "e2"]);
    first.commit().await?;

    let second = store.read_batch().await?.expect("batch");
    assert_eq!(second.events()[0].id(), "e3");
    assert_eq!(second.events()[0].field("action"), Some(&serde_json::json!("delete")));
    second.commit().await?;

    assert!(store.read_batch().await?.is_none());
    store.close().await?;
    // 连接池不受存储关闭影响
    assert!(!pool.is_closed());
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn sql_store_enforces_max_events() -> AnyResult<()> {
    let pool = pool().await?;
    let store = fresh_store(
        &pool,
        "audit_events_limit_test",
        SqlStoreConfig {
            max_events: Some(2),
            ..Default::default()
        },
    )
    .await?;

    store.write(&AuditEvent::new("e1")).await?;
    store.write(&AuditEvent::new("e2")).await?;
    assert!(store.write(&AuditEvent::new("e3")).await.unwrap_err().is_store_full());
    assert_eq!(store.count_events().await?, 2);
    Ok(())
}

async fn insert_raw(pool: &PgPool, table: &str, payload: serde_json::Value) -> AnyResult<()> {
    sqlx::query(&format!("INSERT INTO {table} (event_data) VALUES ($1)"))
        .bind(payload)
        .execute(pool)
        .await?;
    Ok(())
}

async fn dead_letter_count(pool: &PgPool, table: &str) -> AnyResult<i64> {
    Ok(sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}_deadletter"))
        .fetch_one(pool)
        .await?)
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn undecodable_rows_move_to_dead_letter_table() -> AnyResult<()> {
    let pool = pool().await?;
    let table = "audit_events_corrupt_test";
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}_deadletter"))
        .execute(&pool)
        .await?;
    let store = fresh_store(&pool, table, SqlStoreConfig::default()).await?;

    insert_raw(&pool, table, serde_json::json!(["not", "an", "event"])).await?;
    store.write(&AuditEvent::new("valid")).await?;

    let batch = store.read_batch().await?.expect("batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.events()[0].id(), "valid");
    batch.commit().await?;

    assert_eq!(store.count_events().await?, 0);
    assert_eq!(dead_letter_count(&pool, table).await?, 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn undecodable_rows_do_not_hide_later_events() -> AnyResult<()> {
    let pool = pool().await?;
    let table = "audit_events_blocked_test";
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}_deadletter"))
        .execute(&pool)
        .await?;
    let store = fresh_store(
        &pool,
        table,
        SqlStoreConfig {
            batch_size: Some(1),
            max_events: Some(3),
            ..Default::default()
        },
    )
    .await?;

    insert_raw(&pool, table, serde_json::json!("x")).await?;
    insert_raw(&pool, table, serde_json::json!("x")).await?;
    store.write(&AuditEvent::new("e1")).await?;

    let batch = store.read_batch().await?.expect("valid event behind undecodable rows");
    assert_eq!(batch.events()[0].id(), "e1");
    batch.commit().await?;

    // 损坏行已离开主表，不再占用容量
    assert!(store.read_batch().await?.is_none());
    assert_eq!(store.count_events().await?, 0);
    assert_eq!(dead_letter_count(&pool, table).await?, 2);
    store.write(&AuditEvent::new("e2")).await?;
    Ok(())
}
