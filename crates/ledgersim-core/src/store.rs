use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::error::LedgerError;

/// Zones seeded at bootstrap so the simulator has something to operate on
/// from a fresh database. Matches the zone identifiers used throughout the
/// end-to-end scenarios operators exercise against this service.
const SEED_ZONES: &[(&str, &str)] = &[
    ("zone-eu", "Europe"),
    ("zone-us", "United States"),
    ("zone-af", "Africa"),
    ("zone-in", "India"),
    ("zone-apac", "Asia Pacific"),
];

/// Thin wrapper around the shared Postgres pool. No ORM, no migration
/// runner — schema is established with idempotent DDL at boot, the same way
/// the storage layer this was grounded on manages its own tables.
#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) pool: PgPool,
}

impl Store {
    /// Connects with a pool sized for CPU×4 concurrent connections, per the
    /// resource model's pooled-I/O guidance.
    pub async fn connect(database_url: &str) -> Result<Self, LedgerError> {
        let max_connections = (num_cpus() * 4) as u32;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zones (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS zone_controls (
                zone_id TEXT PRIMARY KEY REFERENCES zones(id),
                writes_blocked BOOLEAN NOT NULL DEFAULT false,
                cross_zone_throttle INT NOT NULL DEFAULT 100,
                spool_enabled BOOLEAN NOT NULL DEFAULT false,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                zone_id TEXT NOT NULL REFERENCES zones(id),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transactions (
                id UUID PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                payload_hash TEXT NOT NULL,
                from_account TEXT NOT NULL,
                to_account TEXT NOT NULL,
                amount_units BIGINT NOT NULL CHECK (amount_units > 0),
                zone_id TEXT NOT NULL REFERENCES zones(id),
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_created_at ON transactions(created_at)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS postings (
                id BIGSERIAL PRIMARY KEY,
                txn_id UUID NOT NULL REFERENCES transactions(id),
                account_id TEXT NOT NULL,
                direction TEXT NOT NULL,
                amount_units BIGINT NOT NULL CHECK (amount_units > 0),
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_postings_txn_id ON postings(txn_id)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS balances (
                account_id TEXT PRIMARY KEY,
                balance_units BIGINT NOT NULL DEFAULT 0,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                id UUID PRIMARY KEY,
                event_type TEXT NOT NULL,
                aggregate_type TEXT NOT NULL,
                aggregate_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                published_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_unpublished ON outbox_events(created_at) WHERE published_at IS NULL",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inbox_events (
                consumer TEXT NOT NULL,
                event_id TEXT NOT NULL,
                processed_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (consumer, event_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spooled_transfers (
                id UUID PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                payload_hash TEXT NOT NULL,
                from_account TEXT NOT NULL,
                to_account TEXT NOT NULL,
                amount_units BIGINT NOT NULL CHECK (amount_units > 0),
                zone_id TEXT NOT NULL REFERENCES zones(id),
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                status TEXT NOT NULL,
                fail_reason TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                applied_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_spool_zone_status_created ON spooled_transfers(zone_id, status, created_at)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                id UUID PRIMARY KEY,
                zone_id TEXT NOT NULL REFERENCES zones(id),
                related_txn_id UUID,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                title TEXT NOT NULL,
                details JSONB NOT NULL DEFAULT '{}'::jsonb,
                detected_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_incidents_zone ON incidents(zone_id)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id BIGSERIAL PRIMARY KEY,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                reason TEXT,
                details JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_target ON audit_log(target_type, target_id, created_at)",
        )
        .execute(&mut *tx)
        .await?;

        for (id, name) in SEED_ZONES {
            sqlx::query(
                "INSERT INTO zones (id, name, status) VALUES ($1, $2, 'OK') ON CONFLICT (id) DO NOTHING",
            )
            .bind(id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
