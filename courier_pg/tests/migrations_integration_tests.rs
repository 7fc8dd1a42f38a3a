mod common;

use courier_pg::migrations::Migrator;
use serial_test::serial;

#[tokio::test]
#[serial]
#[ignore = "requires a Postgres database at DATABASE_URL"]
async fn migrator_applies_everything_once() {
    let pool = common::get_pg_pool().await;
    common::teardown(&pool).await;
    let migrator = Migrator::new(pool.clone());

    assert_eq!(migrator.current_version().await.unwrap(), 0);
    assert_eq!(migrator.pending().await.unwrap().len(), 3);

    assert_eq!(migrator.run().await.unwrap(), 3);
    assert_eq!(migrator.current_version().await.unwrap(), 3);
    assert!(migrator.pending().await.unwrap().is_empty());

    assert_eq!(migrator.run().await.unwrap(), 0);

    let tables: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM information_schema.tables
        WHERE table_name IN ('courier_messages', 'courier_changes')
        "#,
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tables.0, 2);

    common::teardown(&pool).await;
}

#[tokio::test]
#[serial]
#[ignore = "requires a Postgres database at DATABASE_URL"]
async fn tampered_migrations_are_detected() {
    let pool = common::migrated_pool().await;
    sqlx::query("UPDATE _courier_migrations SET checksum = 'tampered' WHERE version = 1")
        .execute(&pool)
        .await
        .unwrap();

    let result = Migrator::new(pool.clone()).run().await;

    assert!(matches!(
        result,
        Err(courier_pg::MigrationError::ChecksumMismatch { version: 1, .. })
    ));
    common::teardown(&pool).await;
}
