//! Access to tables owned by the surrounding application.
//!
//! Market updates, events, posts and users are produced elsewhere; the
//! settlement pipeline only reads them, except for `users.ledger_balance`
//! which the minter credits. `create_tables` and the `insert_*` helpers
//! exist for local runs and tests where no host application is present.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool};
use sqlx::Row;

use super::{from_db_time, to_db_time};
use crate::types::EventWindow;

/// Create minimal versions of the host application's tables.
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            ledger_balance INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create users")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            author_id INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create posts")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            opened_at INTEGER NOT NULL,
            closes_at INTEGER NOT NULL,
            outcome INTEGER,
            market_prob REAL NOT NULL DEFAULT 0.5
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create events")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS market_updates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id INTEGER NOT NULL,
            trader_id INTEGER NOT NULL,
            prev_prob REAL NOT NULL,
            new_prob REAL NOT NULL,
            stake_ledger INTEGER NOT NULL,
            had_prior_position INTEGER NOT NULL DEFAULT 0,
            referral_post_id INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create market_updates")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_market_updates_event_time ON market_updates(event_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Writers (host application stand-ins)
// ---------------------------------------------------------------------------

/// A trade to record, before it has an id.
#[derive(Debug, Clone)]
pub struct NewMarketUpdate {
    pub event_id: i64,
    pub trader_id: i64,
    pub prev_prob: f64,
    pub new_prob: f64,
    pub stake_ledger: i64,
    pub had_prior_position: bool,
    pub referral_post_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

pub async fn insert_user(pool: &SqlitePool, username: &str) -> Result<i64> {
    let result = sqlx::query("INSERT INTO users (username) VALUES (?)")
        .bind(username)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to insert user {username}"))?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_post(pool: &SqlitePool, author_id: i64) -> Result<i64> {
    let result = sqlx::query("INSERT INTO posts (author_id) VALUES (?)")
        .bind(author_id)
        .execute(pool)
        .await
        .context("Failed to insert post")?;
    Ok(result.last_insert_rowid())
}

pub async fn insert_event(
    pool: &SqlitePool,
    title: &str,
    opened_at: DateTime<Utc>,
    closes_at: DateTime<Utc>,
    market_prob: f64,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO events (title, opened_at, closes_at, market_prob) VALUES (?, ?, ?, ?)",
    )
    .bind(title)
    .bind(to_db_time(opened_at))
    .bind(to_db_time(closes_at))
    .bind(market_prob)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to insert event {title}"))?;
    Ok(result.last_insert_rowid())
}

pub async fn resolve_event(pool: &SqlitePool, event_id: i64, outcome: bool) -> Result<()> {
    sqlx::query("UPDATE events SET outcome = ?, market_prob = ? WHERE id = ?")
        .bind(outcome)
        .bind(if outcome { 1.0 } else { 0.0 })
        .bind(event_id)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to resolve event {event_id}"))?;
    Ok(())
}

pub async fn insert_market_update(pool: &SqlitePool, update: &NewMarketUpdate) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO market_updates
            (event_id, trader_id, prev_prob, new_prob, stake_ledger,
             had_prior_position, referral_post_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(update.event_id)
    .bind(update.trader_id)
    .bind(update.prev_prob)
    .bind(update.new_prob)
    .bind(update.stake_ledger)
    .bind(update.had_prior_position)
    .bind(update.referral_post_id)
    .bind(to_db_time(update.created_at))
    .execute(pool)
    .await
    .context("Failed to insert market update")?;

    sqlx::query("UPDATE events SET market_prob = ? WHERE id = ?")
        .bind(update.new_prob)
        .bind(update.event_id)
        .execute(pool)
        .await?;

    Ok(result.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Readers
// ---------------------------------------------------------------------------

pub async fn load_event(pool: &SqlitePool, event_id: i64) -> Result<Option<EventWindow>> {
    let row = sqlx::query(
        "SELECT id, opened_at, closes_at, outcome, market_prob FROM events WHERE id = ?",
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(EventWindow {
        id: row.try_get("id")?,
        opened_at: from_db_time(row.try_get("opened_at")?)?,
        closes_at: from_db_time(row.try_get("closes_at")?)?,
        outcome: row.try_get::<Option<i64>, _>("outcome")?.map(|o| o != 0),
        market_prob: row.try_get("market_prob")?,
    }))
}

/// Live probability of an event at (or just before) `at`: the post-trade
/// probability of the latest update no later than `at`.
pub async fn probability_at(
    pool: &SqlitePool,
    event_id: i64,
    at: DateTime<Utc>,
) -> Result<Option<f64>> {
    let prob = sqlx::query_scalar::<_, f64>(
        r#"
        SELECT new_prob FROM market_updates
        WHERE event_id = ? AND created_at <= ?
        ORDER BY created_at DESC, id DESC
        LIMIT 1
        "#,
    )
    .bind(event_id)
    .bind(to_db_time(at))
    .fetch_optional(pool)
    .await?;
    Ok(prob)
}

pub async fn post_author(conn: &mut SqliteConnection, post_id: i64) -> Result<Option<i64>> {
    let author = sqlx::query_scalar::<_, i64>("SELECT author_id FROM posts WHERE id = ?")
        .bind(post_id)
        .fetch_optional(conn)
        .await?;
    Ok(author)
}

/// Credit a user's ledger balance. Returns the number of rows touched,
/// which is zero when the user does not exist.
pub async fn credit_ledger(conn: &mut SqliteConnection, user_id: i64, amount: i64) -> Result<u64> {
    let result = sqlx::query("UPDATE users SET ledger_balance = ledger_balance + ? WHERE id = ?")
        .bind(amount)
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub async fn ledger_balance(pool: &SqlitePool, user_id: i64) -> Result<Option<i64>> {
    let balance = sqlx::query_scalar::<_, i64>("SELECT ledger_balance FROM users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(balance)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_in_memory;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn update(event_id: i64, new_prob: f64, created_at: DateTime<Utc>) -> NewMarketUpdate {
        NewMarketUpdate {
            event_id,
            trader_id: 1,
            prev_prob: 0.5,
            new_prob,
            stake_ledger: 10,
            had_prior_position: false,
            referral_post_id: None,
            created_at,
        }
    }

    #[tokio::test]
    async fn test_event_roundtrip_and_resolution() {
        let pool = open_in_memory().await.unwrap();
        let id = insert_event(&pool, "rain", t0(), t0() + Duration::days(10), 0.4)
            .await
            .unwrap();

        let event = load_event(&pool, id).await.unwrap().unwrap();
        assert_eq!(event.opened_at, t0());
        assert_eq!(event.outcome, None);
        assert_eq!(event.market_prob, 0.4);

        resolve_event(&pool, id, false).await.unwrap();
        let event = load_event(&pool, id).await.unwrap().unwrap();
        assert_eq!(event.outcome, Some(false));
        assert_eq!(event.market_prob, 0.0);

        assert!(load_event(&pool, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probability_at_picks_latest_before() {
        let pool = open_in_memory().await.unwrap();
        let event = insert_event(&pool, "e", t0(), t0() + Duration::days(10), 0.5)
            .await
            .unwrap();
        insert_market_update(&pool, &update(event, 0.55, t0() + Duration::hours(1)))
            .await
            .unwrap();
        insert_market_update(&pool, &update(event, 0.62, t0() + Duration::hours(5)))
            .await
            .unwrap();

        let before_any = probability_at(&pool, event, t0()).await.unwrap();
        assert_eq!(before_any, None);

        let mid = probability_at(&pool, event, t0() + Duration::hours(3)).await.unwrap();
        assert_eq!(mid, Some(0.55));

        let exact = probability_at(&pool, event, t0() + Duration::hours(5)).await.unwrap();
        assert_eq!(exact, Some(0.62));
    }

    #[tokio::test]
    async fn test_credit_ledger_unknown_user() {
        let pool = open_in_memory().await.unwrap();
        let user = insert_user(&pool, "alice").await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        assert_eq!(credit_ledger(&mut conn, user, 40).await.unwrap(), 1);
        assert_eq!(credit_ledger(&mut conn, 999, 40).await.unwrap(), 0);
        drop(conn);

        assert_eq!(ledger_balance(&pool, user).await.unwrap(), Some(40));
    }

    #[tokio::test]
    async fn test_post_author_lookup() {
        let pool = open_in_memory().await.unwrap();
        let user = insert_user(&pool, "bob").await.unwrap();
        let post = insert_post(&pool, user).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        assert_eq!(post_author(&mut conn, post).await.unwrap(), Some(user));
        assert_eq!(post_author(&mut conn, post + 100).await.unwrap(), None);
    }
}
