//! Versioned schema migrations for the wager store

use anyhow::{Context, Result};
use deadpool_postgres::{GenericClient, Object};
use tracing::info;

/// Key of the advisory lock that serialises concurrent migration runs
const MIGRATION_LOCK_KEY: i64 = 0x7761_6765_725f_6462;

/// Run all pending migrations in version order. Everything runs in one
/// transaction under an advisory lock, so processes starting together apply
/// each migration once.
pub async fn run_migrations(conn: &mut Object) -> Result<()> {
    let txn = conn.transaction().await.context("Failed to start migration transaction")?;

    txn.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])
        .await
        .context("Failed to take migration lock")?;

    txn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            id SERIAL PRIMARY KEY,
            version INTEGER NOT NULL UNIQUE,
            name VARCHAR(255) NOT NULL,
            executed_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
            execution_time_ms INTEGER
        )
        "#,
        &[],
    )
    .await
    .context("Failed to create migrations table")?;

    let applied = applied_versions(&txn).await?;

    for migration in migrations() {
        if applied.contains(&migration.version) {
            continue;
        }
        apply_migration(&txn, &migration).await?;
    }

    txn.commit().await.context("Failed to commit migrations")?;
    Ok(())
}

struct Migration {
    version: i32,
    name: &'static str,
    up: &'static str,
}

fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "create_bets",
            up: r#"
                CREATE TABLE IF NOT EXISTS bets (
                    id UUID PRIMARY KEY,
                    group_id UUID NOT NULL,
                    creator_id UUID NOT NULL,
                    title TEXT NOT NULL,
                    description TEXT,
                    bet_type TEXT NOT NULL
                        CHECK (bet_type IN ('BINARY', 'MULTIPLE_CHOICE', 'PREDICTION')),
                    stake_type TEXT NOT NULL CHECK (stake_type IN ('CREDIT', 'SOCIAL')),
                    resolution_method TEXT NOT NULL
                        CHECK (resolution_method IN ('SELF', 'ASSIGNED_RESOLVERS', 'PARTICIPANT_VOTE')),
                    fixed_stake_amount BIGINT CHECK (fixed_stake_amount > 0),
                    social_stake_description TEXT,
                    minimum_bet BIGINT,
                    maximum_bet BIGINT,
                    betting_deadline TIMESTAMP WITH TIME ZONE NOT NULL,
                    resolve_date TIMESTAMP WITH TIME ZONE NOT NULL,
                    minimum_votes_required INTEGER CHECK (minimum_votes_required >= 1),
                    allow_creator_vote BOOLEAN NOT NULL DEFAULT FALSE,
                    total_pool BIGINT NOT NULL DEFAULT 0 CHECK (total_pool >= 0),
                    total_participants INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL DEFAULT 'OPEN'
                        CHECK (status IN ('OPEN', 'CLOSED', 'RESOLVED', 'CANCELLED')),
                    outcome JSONB,
                    resolved_at TIMESTAMP WITH TIME ZONE,
                    cancelled_at TIMESTAMP WITH TIME ZONE,
                    cancellation_reason TEXT,
                    loser_claimed_at TIMESTAMP WITH TIME ZONE,
                    all_winners_confirmed_at TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    CONSTRAINT check_deadlines CHECK (betting_deadline < resolve_date)
                );

                CREATE INDEX IF NOT EXISTS idx_bets_group ON bets(group_id);
                CREATE INDEX IF NOT EXISTS idx_bets_open_deadline
                    ON bets(betting_deadline) WHERE status = 'OPEN';
                CREATE INDEX IF NOT EXISTS idx_bets_closed_resolve_date
                    ON bets(resolve_date) WHERE status = 'CLOSED';

                CREATE TABLE IF NOT EXISTS bet_options (
                    bet_id UUID NOT NULL REFERENCES bets(id),
                    option_index SMALLINT NOT NULL CHECK (option_index BETWEEN 1 AND 4),
                    label TEXT NOT NULL,
                    pool BIGINT NOT NULL DEFAULT 0 CHECK (pool >= 0),
                    participant_count INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (bet_id, option_index)
                );
            "#,
        },
        Migration {
            version: 2,
            name: "create_participations_and_votes",
            up: r#"
                CREATE TABLE IF NOT EXISTS bet_participations (
                    id UUID PRIMARY KEY,
                    bet_id UUID NOT NULL REFERENCES bets(id),
                    user_id UUID NOT NULL,
                    selection JSONB NOT NULL,
                    option_index SMALLINT,
                    amount BIGINT NOT NULL CHECK (amount >= 0),
                    insurance JSONB,
                    status TEXT NOT NULL DEFAULT 'ACTIVE'
                        CHECK (status IN ('ACTIVE', 'WON', 'LOST', 'DRAW', 'REFUNDED')),
                    payout BIGINT NOT NULL DEFAULT 0,
                    fulfillment_confirmed_at TIMESTAMP WITH TIME ZONE,
                    confirmation_notes TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    settled_at TIMESTAMP WITH TIME ZONE,
                    CONSTRAINT unique_participation UNIQUE (bet_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS bet_resolvers (
                    bet_id UUID NOT NULL REFERENCES bets(id),
                    user_id UUID NOT NULL,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (bet_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS bet_resolution_votes (
                    id UUID PRIMARY KEY,
                    bet_id UUID NOT NULL REFERENCES bets(id),
                    voter_id UUID NOT NULL,
                    choice JSONB NOT NULL,
                    reasoning TEXT,
                    active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_votes_one_active
                    ON bet_resolution_votes(bet_id, voter_id) WHERE active;
                CREATE INDEX IF NOT EXISTS idx_votes_bet ON bet_resolution_votes(bet_id);
            "#,
        },
        Migration {
            version: 3,
            name: "create_fulfillment_and_balances",
            up: r#"
                CREATE TABLE IF NOT EXISTS loser_fulfillment_claims (
                    bet_id UUID NOT NULL REFERENCES bets(id),
                    user_id UUID NOT NULL,
                    proof_url TEXT,
                    proof_description TEXT,
                    claimed_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL,
                    PRIMARY KEY (bet_id, user_id)
                );

                CREATE TABLE IF NOT EXISTS user_balances (
                    user_id UUID PRIMARY KEY,
                    balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                );
            "#,
        },
    ]
}

async fn applied_versions(client: &impl GenericClient) -> Result<Vec<i32>> {
    let rows = client
        .query("SELECT version FROM schema_migrations ORDER BY version", &[])
        .await
        .context("Failed to query applied migrations")?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

async fn apply_migration(client: &impl GenericClient, migration: &Migration) -> Result<()> {
    info!(version = migration.version, name = migration.name, "Applying migration");
    let start = std::time::Instant::now();

    client
        .batch_execute(migration.up)
        .await
        .with_context(|| format!("Failed to execute migration {}", migration.version))?;

    let elapsed = start.elapsed().as_millis() as i32;
    client
        .execute(
            "INSERT INTO schema_migrations (version, name, execution_time_ms) VALUES ($1, $2, $3)",
            &[&migration.version, &migration.name, &elapsed],
        )
        .await
        .context("Failed to record migration")?;

    Ok(())
}
