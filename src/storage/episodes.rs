//! Read-side access to settled episodes and their payouts.

use anyhow::Result;
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;

use super::{from_db_time, from_db_time_opt};
use crate::types::{Episode, Payout};

#[derive(Debug, FromRow)]
struct EpisodeRow {
    id: i64,
    market_update_id: i64,
    post_id: i64,
    event_id: i64,
    trader_id: i64,
    bucket_start: i64,
    episode_type: String,
    is_meaningful: i64,
    p_before: f64,
    p_after: f64,
    s_early: Option<f64>,
    s_early_at: Option<i64>,
    s_mid: Option<f64>,
    s_mid_at: Option<i64>,
    s_final: Option<f64>,
    s_final_at: Option<i64>,
    combined_score: Option<f64>,
    created_at: i64,
}

impl TryFrom<EpisodeRow> for Episode {
    type Error = anyhow::Error;

    fn try_from(row: EpisodeRow) -> Result<Self> {
        Ok(Episode {
            id: row.id,
            market_update_id: row.market_update_id,
            post_id: row.post_id,
            event_id: row.event_id,
            trader_id: row.trader_id,
            bucket_start: from_db_time(row.bucket_start)?,
            episode_type: row.episode_type.parse()?,
            is_meaningful: row.is_meaningful != 0,
            p_before: row.p_before,
            p_after: row.p_after,
            s_early: row.s_early,
            s_early_at: from_db_time_opt(row.s_early_at)?,
            s_mid: row.s_mid,
            s_mid_at: from_db_time_opt(row.s_mid_at)?,
            s_final: row.s_final,
            s_final_at: from_db_time_opt(row.s_final_at)?,
            combined_score: row.combined_score,
            created_at: from_db_time(row.created_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct PayoutRow {
    id: i64,
    episode_id: i64,
    component: String,
    post_id: i64,
    author_id: i64,
    event_id: i64,
    score_component: f64,
    mint_rate: f64,
    reward_ledger: i64,
    payout_status: String,
    created_at: i64,
}

impl TryFrom<PayoutRow> for Payout {
    type Error = anyhow::Error;

    fn try_from(row: PayoutRow) -> Result<Self> {
        Ok(Payout {
            id: row.id,
            episode_id: row.episode_id,
            component: row.component.parse()?,
            post_id: row.post_id,
            author_id: row.author_id,
            event_id: row.event_id,
            score_component: row.score_component,
            mint_rate: row.mint_rate,
            reward_ledger: row.reward_ledger,
            payout_status: row.payout_status.parse()?,
            created_at: from_db_time(row.created_at)?,
        })
    }
}

pub async fn load_episode(pool: &SqlitePool, episode_id: i64) -> Result<Option<Episode>> {
    let row = sqlx::query_as::<_, EpisodeRow>(
        r#"
        SELECT id, market_update_id, post_id, event_id, trader_id, bucket_start,
               episode_type, is_meaningful, p_before, p_after,
               s_early, s_early_at, s_mid, s_mid_at, s_final, s_final_at,
               combined_score, created_at
        FROM alpha_episodes WHERE id = ?
        "#,
    )
    .bind(episode_id)
    .fetch_optional(pool)
    .await?;

    row.map(Episode::try_from).transpose()
}

/// Payouts of one episode in horizon order.
pub async fn payouts_for_episode(pool: &SqlitePool, episode_id: i64) -> Result<Vec<Payout>> {
    let rows = sqlx::query_as::<_, PayoutRow>(
        r#"
        SELECT id, episode_id, component, post_id, author_id, event_id,
               score_component, mint_rate, reward_ledger, payout_status, created_at
        FROM alpha_payouts WHERE episode_id = ?
        ORDER BY CASE component WHEN 'early' THEN 0 WHEN 'mid' THEN 1 ELSE 2 END
        "#,
    )
    .bind(episode_id)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(Payout::try_from).collect()
}
