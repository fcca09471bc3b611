//! Backfill and copy migrations against a real Postgres.

mod common;

use std::collections::BTreeMap;

use background_migrations::{
    BackfillColumn, ColumnValue, ConfigurationError, CopyColumn, EnqueueOptions, ExecutionMode,
    MigrationJobStatus, MigrationStatus, MigrationStore,
};
use common::TestHarness;
use test_context::test_context;

fn options() -> EnqueueOptions {
    EnqueueOptions::builder()
        .batch_size(100)
        .sub_batch_size(25)
        .sub_batch_pause_ms(0)
        .build()
}

#[test_context(TestHarness)]
#[tokio::test]
async fn backfill_sets_every_row(ctx: &TestHarness) {
    let table = ctx.create_users_table(250).await.unwrap();
    let migrations = ctx.migrations();

    let migration = migrations
        .backfill(
            &table,
            BTreeMap::from([("admin".to_string(), ColumnValue::Bool(false))]),
            options(),
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    assert_eq!(migration.status, MigrationStatus::Finished);
    assert_eq!((migration.min_value, migration.max_value), (1, 250));
    assert_eq!(ctx.count_where(&table, "admin = false").await.unwrap(), 250);

    let report = migrations.status(migration.id).await.unwrap();
    assert_eq!(report.jobs_total, 3);
    assert_eq!(report.rows_affected, 250);
    assert_eq!(report.progress, 100.0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn replaying_a_backfill_changes_nothing(ctx: &TestHarness) {
    let table = ctx.create_users_table(120).await.unwrap();
    let migrations = ctx.migrations();
    let args = BackfillColumn::new(&table, [("admin", true)]);

    migrations
        .enqueue(args.clone(), options(), ExecutionMode::Inline)
        .await
        .unwrap();
    let replay = migrations
        .enqueue(args, options(), ExecutionMode::Inline)
        .await
        .unwrap();

    let report = migrations.status(replay.id).await.unwrap();
    assert_eq!(replay.status, MigrationStatus::Finished);
    assert_eq!(report.rows_affected, 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn backfill_respects_explicit_bounds(ctx: &TestHarness) {
    let table = ctx.create_users_table(100).await.unwrap();
    let options = EnqueueOptions::builder()
        .min_value(11)
        .max_value(20)
        .sub_batch_pause_ms(0)
        .build();

    ctx.migrations()
        .enqueue(
            BackfillColumn::new(&table, [("admin", true)]),
            options,
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    assert_eq!(ctx.count_where(&table, "admin").await.unwrap(), 10);
    assert_eq!(
        ctx.count_where(&table, "admin AND id BETWEEN 11 AND 20")
            .await
            .unwrap(),
        10
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn empty_table_finishes_immediately(ctx: &TestHarness) {
    let table = ctx.create_users_table(0).await.unwrap();

    let migration = ctx
        .migrations()
        .enqueue(
            BackfillColumn::new(&table, [("admin", false)]),
            options(),
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    assert_eq!((migration.min_value, migration.max_value), (1, 1));
    assert_eq!(migration.status, MigrationStatus::Finished);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn constraint_violation_fails_after_max_attempts(ctx: &TestHarness) {
    let table = ctx.create_users_table(250).await.unwrap();
    let migrations = ctx.migrations();
    let options = EnqueueOptions::builder()
        .batch_size(100)
        .sub_batch_size(25)
        .sub_batch_pause_ms(0)
        .batch_max_attempts(3)
        .build();

    let migration = migrations
        .enqueue(
            BackfillColumn::new(&table, [("score", -1i64)]),
            options,
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    assert_eq!(migration.status, MigrationStatus::Failed);

    let jobs = migrations.store().jobs_for_migration(migration.id).await.unwrap();
    assert_eq!(jobs.len(), 1, "no range after the failed one is claimed");
    assert_eq!(jobs[0].status, MigrationJobStatus::Failed);
    assert_eq!(jobs[0].attempts, 3);
    assert!(jobs[0]
        .error_backtrace
        .as_deref()
        .unwrap_or_default()
        .contains("check constraint"));
    assert_eq!(ctx.count_where(&table, "score IS NOT NULL").await.unwrap(), 0);
}

#[test_context(TestHarness)]
#[tokio::test]
async fn copy_with_cast_converts_every_row(ctx: &TestHarness) {
    let table = ctx.create_users_table(180).await.unwrap();

    let migration = ctx
        .migrations()
        .copy_columns(
            &table,
            vec!["id".to_string()],
            vec!["id_for_type_change".to_string()],
            BTreeMap::from([("id".to_string(), "::text".to_string())]),
            options(),
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    assert_eq!(migration.status, MigrationStatus::Finished);
    assert_eq!(
        ctx.count_where(&table, "id_for_type_change = id::text")
            .await
            .unwrap(),
        180
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn replaying_a_cast_copy_changes_nothing(ctx: &TestHarness) {
    let table = ctx.create_users_table(130).await.unwrap();
    let migrations = ctx.migrations();

    let mut runs = Vec::new();
    for _ in 0..2 {
        let migration = migrations
            .copy_columns(
                &table,
                vec!["id".to_string()],
                vec!["id_for_type_change".to_string()],
                BTreeMap::from([("id".to_string(), "::text".to_string())]),
                options(),
                ExecutionMode::Inline,
            )
            .await
            .unwrap();
        assert_eq!(migration.status, MigrationStatus::Finished);
        runs.push(migrations.status(migration.id).await.unwrap().rows_affected);
    }

    assert_eq!(runs, vec![130, 0]);
    assert_eq!(
        ctx.count_where(&table, "id_for_type_change = id::text")
            .await
            .unwrap(),
        130
    );
}

#[test_context(TestHarness)]
#[tokio::test]
async fn copy_without_cast_is_rejected_before_persisting(ctx: &TestHarness) {
    let table = ctx.create_users_table(10).await.unwrap();
    let migrations = ctx.migrations();

    let err = migrations
        .enqueue(
            CopyColumn::new(&table, ["id"], ["id_for_type_change"]),
            options(),
            ExecutionMode::Inline,
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::MissingTypeCast { from_type, to_type, .. })
            if from_type == "int8" && to_type == "text"
    ));

    let persisted = migrations.store().list_migrations().await.unwrap();
    assert!(persisted.iter().all(|m| m.table_name != table));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn widening_copy_needs_no_cast(ctx: &TestHarness) {
    let table = ctx.create_users_table(75).await.unwrap();

    let migration = ctx
        .migrations()
        .enqueue(
            CopyColumn::new(&table, ["legacy_id"], ["new_id"]),
            options(),
            ExecutionMode::Inline,
        )
        .await
        .unwrap();

    assert_eq!(migration.status, MigrationStatus::Finished);
    assert_eq!(ctx.count_where(&table, "new_id = id").await.unwrap(), 75);
}
