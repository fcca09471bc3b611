//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared by every test in a binary. Each test
//! gets its own pool and creates its own uniquely named tables, so tests
//! never see each other's rows.

use std::sync::Arc;

use anyhow::{Context, Result};
use background_migrations::store::run_schema_migrations;
use background_migrations::{
    BackgroundMigrations, MigrationStore, PostgresMigrationStore, RunnerConfig,
};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;

        run_schema_migrations(&pool).await?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test handle on the shared database.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let table = ctx.create_users_table(100).await.unwrap();
///     // ...
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        Ok(Self { db_pool })
    }

    pub fn store(&self) -> Arc<dyn MigrationStore> {
        Arc::new(PostgresMigrationStore::new(self.db_pool.clone()))
    }

    pub fn migrations(&self) -> BackgroundMigrations {
        BackgroundMigrations::postgres(self.db_pool.clone(), RunnerConfig::default())
    }

    /// Create a `users`-shaped table with ids `1..=rows` and return its name.
    ///
    /// Columns: `id BIGINT`, `admin BOOLEAN` (NULL), `legacy_id INTEGER`
    /// (= id), `new_id BIGINT`, `id_for_type_change TEXT`,
    /// `score INTEGER CHECK (score >= 0)`.
    pub async fn create_users_table(&self, rows: i64) -> Result<String> {
        let table = format!("users_{}", Uuid::new_v4().simple());

        sqlx::query(&format!(
            r#"
            CREATE TABLE {table} (
                id BIGINT PRIMARY KEY,
                admin BOOLEAN,
                legacy_id INTEGER,
                new_id BIGINT,
                id_for_type_change TEXT,
                score INTEGER CHECK (score >= 0)
            )
            "#
        ))
        .execute(&self.db_pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(&format!(
            "INSERT INTO {table} (id, legacy_id) SELECT i, i FROM generate_series(1, $1::BIGINT) AS i"
        ))
        .bind(rows)
        .execute(&self.db_pool)
        .await
        .context("Failed to seed users table")?;

        Ok(table)
    }

    pub async fn count_where(&self, table: &str, condition: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            table, condition
        ))
        .fetch_one(&self.db_pool)
        .await?;
        Ok(count)
    }
}
