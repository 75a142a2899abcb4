//! Shared fixtures for settlement integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use sqlx::sqlite::SqlitePool;
use std::path::PathBuf;

use alpha_settlement::storage::{self, collaborators};
use alpha_settlement::storage::collaborators::NewMarketUpdate;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap()
}

pub fn day(n: i64) -> DateTime<Utc> {
    t0() + Duration::days(n)
}

/// A SQLite file under the system temp dir, removed on drop.
pub struct TempDb {
    pub path: PathBuf,
    pub pool: SqlitePool,
}

impl TempDb {
    pub async fn new(max_connections: u32) -> Self {
        let path = std::env::temp_dir().join(format!("alpha-settlement-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let pool = storage::connect(&url, max_connections).await.unwrap();
        collaborators::create_tables(&pool).await.unwrap();
        storage::migrate(&pool).await.unwrap();
        Self { path, pool }
    }
}

impl Drop for TempDb {
    fn drop(&mut self) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = self.path.clone().into_os_string();
            file.push(suffix);
            let _ = std::fs::remove_file(file);
        }
    }
}

/// One event open for 100 days from `t0`, plus a trader.
pub struct Market {
    pub event_id: i64,
    pub trader_id: i64,
}

pub async fn open_market(pool: &SqlitePool) -> Market {
    let trader_id = collaborators::insert_user(pool, &format!("trader-{}", uuid::Uuid::new_v4()))
        .await
        .unwrap();
    let event_id = collaborators::insert_event(pool, "will it ship", t0(), day(100), 0.40)
        .await
        .unwrap();
    Market { event_id, trader_id }
}

/// The 0.40 → 0.60 attention trade, stake 500, referred by `post_id`.
pub async fn referred_trade(pool: &SqlitePool, market: &Market, post_id: i64) -> i64 {
    collaborators::insert_market_update(
        pool,
        &NewMarketUpdate {
            event_id: market.event_id,
            trader_id: market.trader_id,
            prev_prob: 0.40,
            new_prob: 0.60,
            stake_ledger: 500,
            had_prior_position: false,
            referral_post_id: Some(post_id),
            created_at: t0() + Duration::hours(1),
        },
    )
    .await
    .unwrap()
}

pub async fn payout_rows(pool: &SqlitePool) -> Vec<(i64, String, i64, String)> {
    sqlx::query_as(
        "SELECT episode_id, component, reward_ledger, payout_status FROM alpha_payouts ORDER BY episode_id, component",
    )
    .fetch_all(pool)
    .await
    .unwrap()
}
