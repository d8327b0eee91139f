use sqlx::SqlitePool;

use crate::config::Policy;

pub async fn run_migrations(pool: &SqlitePool, policy_defaults: &Policy) -> anyhow::Result<()> {
    // Enable WAL mode for better concurrent access
    sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON").execute(pool).await?;

    // Create migrations tracking table
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(pool)
    .await?;

    // Run 001_init only if not already applied
    let applied: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM _migrations WHERE name = '001_init'")
            .fetch_one(pool)
            .await?;

    if !applied {
        let migration_sql = include_str!("../migrations/001_init.sql");
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(pool).await?;
            }
        }
        sqlx::query("INSERT INTO _migrations (name) VALUES ('001_init')")
            .execute(pool)
            .await?;
        tracing::info!("Applied migration: 001_init");
    }

    seed_policy_row(pool, policy_defaults).await?;

    tracing::info!("Database migrations up to date");
    Ok(())
}

/// The `policies` table holds exactly one row. Seed it from the environment
/// defaults on first boot; later boots leave operator edits alone.
async fn seed_policy_row(pool: &SqlitePool, defaults: &Policy) -> anyhow::Result<()> {
    let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM policies WHERE id = 1")
        .fetch_one(pool)
        .await?;
    if exists {
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO policies (
            id, lead_time_minutes, future_window_days, reschedule_lock_hours,
            cancel_lock_hours, hold_ttl_minutes, online_discount_percent,
            online_enabled, reschedule_max, slot_grid_minutes, reminder_lead_minutes
        ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(defaults.lead_time_minutes)
    .bind(defaults.future_window_days)
    .bind(defaults.reschedule_lock_hours)
    .bind(defaults.cancel_lock_hours)
    .bind(defaults.hold_ttl_minutes)
    .bind(defaults.online_discount_percent)
    .bind(defaults.online_enabled)
    .bind(defaults.reschedule_max)
    .bind(defaults.slot_grid_minutes)
    .bind(defaults.reminder_lead_minutes)
    .execute(pool)
    .await?;
    tracing::info!("Seeded policies row from environment defaults");
    Ok(())
}
