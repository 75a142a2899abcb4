//! Horizon scorer.
//!
//! Fills in the early, mid and final score of each meaningful episode once
//! its horizon has passed. The score is the Brier-score improvement of the
//! trade against a target probability, floored at zero. Each field is
//! written through `COALESCE`, so a value, once set, is never replaced.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::FromRow;
use tracing::{debug, info, warn};

use crate::config::SettlementConfig;
use crate::storage::collaborators::probability_at;
use crate::storage::{from_db_time, to_db_time};
use crate::types::EventWindow;

/// Reduction in squared error achieved by moving from `p_before` to
/// `p_after`, relative to `target`. Never negative: moves away from the
/// target earn nothing rather than a penalty.
pub fn compute_score(target: f64, p_before: f64, p_after: f64) -> f64 {
    let before = (p_before - target).powi(2);
    let after = (p_after - target).powi(2);
    (before - after).max(0.0)
}

/// Wall-clock checkpoints for the early and mid horizons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HorizonTimes {
    pub early: DateTime<Utc>,
    pub mid: DateTime<Utc>,
}

/// Place the early/mid horizons at their fractions of the event's
/// open-to-close span. A zero or inverted span puts both at the open time.
pub fn horizon_times(event: &EventWindow, config: &SettlementConfig) -> HorizonTimes {
    let span = (event.closes_at - event.opened_at).num_seconds().max(0) as f64;
    let at = |fraction: f64| event.opened_at + Duration::seconds((span * fraction).floor() as i64);
    HorizonTimes {
        early: at(config.first_horizon_fraction),
        mid: at(config.second_horizon_fraction),
    }
}

// ---------------------------------------------------------------------------
// Candidate rows
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct ScoringRow {
    id: i64,
    p_before: f64,
    p_after: f64,
    s_early: Option<f64>,
    s_mid: Option<f64>,
    s_final: Option<f64>,
    event_id: i64,
    opened_at: i64,
    closes_at: i64,
    outcome: Option<i64>,
    market_prob: f64,
}

impl ScoringRow {
    fn event(&self) -> Result<EventWindow> {
        Ok(EventWindow {
            id: self.event_id,
            opened_at: from_db_time(self.opened_at)?,
            closes_at: from_db_time(self.closes_at)?,
            outcome: self.outcome.map(|o| o != 0),
            market_prob: self.market_prob,
        })
    }
}

/// Scores computed for one episode in this pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreUpdate {
    pub early: Option<f64>,
    pub mid: Option<f64>,
    pub fin: Option<f64>,
}

impl ScoreUpdate {
    pub fn is_empty(&self) -> bool {
        self.early.is_none() && self.mid.is_none() && self.fin.is_none()
    }
}

/// Counters from one scoring pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub examined: u64,
    pub early_scored: u64,
    pub mid_scored: u64,
    pub final_scored: u64,
    /// Episodes skipped because their row or event could not be scored.
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

pub struct HorizonScorer {
    pool: SqlitePool,
    config: SettlementConfig,
}

impl HorizonScorer {
    pub fn new(pool: SqlitePool, config: SettlementConfig) -> Self {
        Self { pool, config }
    }

    /// Score every meaningful episode with a due, unset horizon.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<ScoreReport> {
        let rows = self.due_episodes(now).await?;
        let mut report = ScoreReport {
            examined: rows.len() as u64,
            ..Default::default()
        };

        for row in rows {
            let update = match self.score_row(&row, now).await {
                Ok(update) => update,
                Err(e) => {
                    warn!(episode_id = row.id, error = %e, "Episode scoring failed, skipping");
                    report.failed += 1;
                    continue;
                }
            };
            if update.is_empty() {
                continue;
            }

            report.early_scored += update.early.is_some() as u64;
            report.mid_scored += update.mid.is_some() as u64;
            report.final_scored += update.fin.is_some() as u64;

            debug!(
                episode_id = row.id,
                event_id = row.event_id,
                early = ?update.early,
                mid = ?update.mid,
                fin = ?update.fin,
                "Episode scored"
            );
        }

        info!(
            examined = report.examined,
            early = report.early_scored,
            mid = report.mid_scored,
            fin = report.final_scored,
            failed = report.failed,
            "Horizon scoring complete"
        );
        Ok(report)
    }

    /// Score and persist one episode. Errors are confined to that episode.
    async fn score_row(&self, row: &ScoringRow, now: DateTime<Utc>) -> Result<ScoreUpdate> {
        let event = row.event()?;
        let update = self.score_episode(row, &event, now).await?;
        if !update.is_empty() {
            self.persist(row.id, &update, now).await?;
        }
        Ok(update)
    }

    async fn due_episodes(&self, now: DateTime<Utc>) -> Result<Vec<ScoringRow>> {
        let rows = sqlx::query_as::<_, ScoringRow>(
            r#"
            SELECT e.id, e.p_before, e.p_after, e.s_early, e.s_mid, e.s_final,
                   ev.id AS event_id, ev.opened_at, ev.closes_at, ev.outcome, ev.market_prob
            FROM alpha_episodes e
            JOIN events ev ON ev.id = e.event_id
            WHERE e.is_meaningful = 1
              AND (
                   (e.s_early IS NULL AND ev.opened_at
                        + CAST(?1 * MAX(ev.closes_at - ev.opened_at, 0) AS INTEGER) <= ?3)
                OR (e.s_mid IS NULL AND ev.opened_at
                        + CAST(?2 * MAX(ev.closes_at - ev.opened_at, 0) AS INTEGER) <= ?3)
                OR (e.s_final IS NULL AND ev.outcome IS NOT NULL)
              )
            ORDER BY e.id
            LIMIT ?4
            "#,
        )
        .bind(self.config.first_horizon_fraction)
        .bind(self.config.second_horizon_fraction)
        .bind(to_db_time(now))
        .bind(self.config.score_batch_size)
        .fetch_all(&self.pool)
        .await
        .context("Failed to select episodes due for scoring")?;
        Ok(rows)
    }

    async fn score_episode(
        &self,
        row: &ScoringRow,
        event: &EventWindow,
        now: DateTime<Utc>,
    ) -> Result<ScoreUpdate> {
        let times = horizon_times(event, &self.config);
        let mut update = ScoreUpdate::default();

        if row.s_early.is_none() && now >= times.early {
            let target = self.target_at(event, times.early).await?;
            update.early = Some(compute_score(target, row.p_before, row.p_after));
        }

        if row.s_mid.is_none() && now >= times.mid {
            let target = self.target_at(event, times.mid).await?;
            update.mid = Some(compute_score(target, row.p_before, row.p_after));
        }

        if row.s_final.is_none() {
            if let Some(outcome) = event.outcome {
                let target = if outcome { 1.0 } else { 0.0 };
                update.fin = Some(compute_score(target, row.p_before, row.p_after));
            }
        }

        Ok(update)
    }

    /// The market's belief at a horizon: the last traded probability at or
    /// before it, or the live probability when nothing traded earlier.
    async fn target_at(&self, event: &EventWindow, at: DateTime<Utc>) -> Result<f64> {
        let traded = probability_at(&self.pool, event.id, at).await?;
        Ok(traded.unwrap_or(event.market_prob))
    }

    async fn persist(&self, episode_id: i64, update: &ScoreUpdate, now: DateTime<Utc>) -> Result<()> {
        let stamp = |score: Option<f64>| score.map(|_| to_db_time(now));

        sqlx::query(
            r#"
            UPDATE alpha_episodes SET
                s_early = COALESCE(s_early, ?1),
                s_early_at = COALESCE(s_early_at, ?2),
                s_mid = COALESCE(s_mid, ?3),
                s_mid_at = COALESCE(s_mid_at, ?4),
                s_final = COALESCE(s_final, ?5),
                s_final_at = COALESCE(s_final_at, ?6)
            WHERE id = ?7
            "#,
        )
        .bind(update.early)
        .bind(stamp(update.early))
        .bind(update.mid)
        .bind(stamp(update.mid))
        .bind(update.fin)
        .bind(stamp(update.fin))
        .bind(episode_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to persist scores for episode {episode_id}"))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::builder::EpisodeBuilder;
    use crate::storage::collaborators::{
        insert_event, insert_market_update, resolve_event, NewMarketUpdate,
    };
    use crate::storage::open_in_memory;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    async fn setup(prev: f64, new: f64) -> (SqlitePool, i64) {
        let pool = open_in_memory().await.unwrap();
        // 100-day event: early at day 25, mid at day 50.
        let event = insert_event(&pool, "e", t0(), t0() + Duration::days(100), prev)
            .await
            .unwrap();
        insert_market_update(
            &pool,
            &NewMarketUpdate {
                event_id: event,
                trader_id: 1,
                prev_prob: prev,
                new_prob: new,
                stake_ledger: 500,
                had_prior_position: false,
                referral_post_id: Some(1),
                created_at: t0() + Duration::days(1),
            },
        )
        .await
        .unwrap();
        EpisodeBuilder::new(pool.clone(), SettlementConfig::default())
            .run(t0() + Duration::days(1))
            .await
            .unwrap();
        (pool, event)
    }

    async fn scores(pool: &SqlitePool) -> (Option<f64>, Option<f64>, Option<f64>) {
        sqlx::query_as("SELECT s_early, s_mid, s_final FROM alpha_episodes LIMIT 1")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[test]
    fn test_score_rewards_move_toward_truth() {
        let score = compute_score(1.0, 0.5, 0.8);
        assert!((score - 0.21).abs() < 1e-12);
    }

    #[test]
    fn test_score_floors_move_away_from_truth() {
        assert_eq!(compute_score(1.0, 0.5, 0.2), 0.0);
    }

    #[test]
    fn test_score_never_negative_on_grid() {
        let grid: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        for &target in &grid {
            for &before in &grid {
                for &after in &grid {
                    assert!(compute_score(target, before, after) >= 0.0);
                }
            }
        }
    }

    #[test]
    fn test_horizon_times_fractions() {
        let event = EventWindow {
            id: 1,
            opened_at: t0(),
            closes_at: t0() + Duration::days(100),
            outcome: None,
            market_prob: 0.5,
        };
        let times = horizon_times(&event, &SettlementConfig::default());
        assert_eq!(times.early, t0() + Duration::days(25));
        assert_eq!(times.mid, t0() + Duration::days(50));
    }

    #[test]
    fn test_horizon_times_degenerate_span() {
        let event = EventWindow {
            id: 1,
            opened_at: t0(),
            closes_at: t0() - Duration::days(1),
            outcome: None,
            market_prob: 0.5,
        };
        let times = horizon_times(&event, &SettlementConfig::default());
        assert_eq!(times.early, t0());
        assert_eq!(times.mid, t0());
    }

    #[tokio::test]
    async fn test_nothing_scored_before_first_horizon() {
        let (pool, _) = setup(0.40, 0.60).await;
        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        let report = scorer.run(t0() + Duration::days(10)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(scores(&pool).await, (None, None, None));
    }

    #[tokio::test]
    async fn test_early_uses_probability_at_horizon() {
        let (pool, event) = setup(0.40, 0.60).await;
        // Trade after the early horizon must not affect the early target.
        insert_market_update(
            &pool,
            &NewMarketUpdate {
                event_id: event,
                trader_id: 2,
                prev_prob: 0.60,
                new_prob: 0.90,
                stake_ledger: 10,
                had_prior_position: true,
                referral_post_id: None,
                created_at: t0() + Duration::days(30),
            },
        )
        .await
        .unwrap();

        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        let report = scorer.run(t0() + Duration::days(40)).await.unwrap();
        assert_eq!(report.early_scored, 1);
        assert_eq!(report.mid_scored, 0);

        let (early, mid, fin) = scores(&pool).await;
        // Target 0.60: (0.4-0.6)^2 - 0 = 0.04
        assert!((early.unwrap() - 0.04).abs() < 1e-12);
        assert_eq!(mid, None);
        assert_eq!(fin, None);

        scorer.run(t0() + Duration::days(60)).await.unwrap();
        let (_, mid, _) = scores(&pool).await;
        // Target 0.90: 0.25 - 0.09 = 0.16
        assert!((mid.unwrap() - 0.16).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_falls_back_to_live_probability() {
        let pool = open_in_memory().await.unwrap();
        let event = insert_event(&pool, "e", t0(), t0() + Duration::days(100), 0.75)
            .await
            .unwrap();
        // Episode for a trade with no recorded market history.
        sqlx::query(
            "INSERT INTO alpha_episodes (market_update_id, post_id, event_id, trader_id, bucket_start,
                episode_type, is_meaningful, p_before, p_after, created_at)
             VALUES (1, 1, ?, 1, 0, 'belief', 1, 0.5, 0.7, 0)",
        )
        .bind(event)
        .execute(&pool)
        .await
        .unwrap();

        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        scorer.run(t0() + Duration::days(30)).await.unwrap();
        let (early, _, _) = scores(&pool).await;
        // 0.0625 - 0.0025
        assert!((early.unwrap() - 0.06).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_final_scored_on_resolution() {
        let (pool, event) = setup(0.40, 0.60).await;
        resolve_event(&pool, event, true).await.unwrap();

        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        let report = scorer.run(t0() + Duration::days(2)).await.unwrap();
        assert_eq!(report.final_scored, 1);
        assert_eq!(report.early_scored, 0);

        let (_, _, fin) = scores(&pool).await;
        assert!((fin.unwrap() - 0.20).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_scores_are_never_overwritten() {
        let (pool, event) = setup(0.40, 0.60).await;
        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        scorer.run(t0() + Duration::days(60)).await.unwrap();
        let first = scores(&pool).await;
        let first_at: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT s_early_at, s_mid_at FROM alpha_episodes LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();

        // The market moves and the event resolves against the trade.
        insert_market_update(
            &pool,
            &NewMarketUpdate {
                event_id: event,
                trader_id: 3,
                prev_prob: 0.60,
                new_prob: 0.05,
                stake_ledger: 10,
                had_prior_position: true,
                referral_post_id: None,
                created_at: t0() + Duration::days(20),
            },
        )
        .await
        .unwrap();
        resolve_event(&pool, event, false).await.unwrap();

        scorer.run(t0() + Duration::days(90)).await.unwrap();
        let second = scores(&pool).await;
        let second_at: (Option<i64>, Option<i64>) =
            sqlx::query_as("SELECT s_early_at, s_mid_at FROM alpha_episodes LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();

        assert_eq!(first.0, second.0);
        assert_eq!(first.1, second.1);
        assert_eq!(first_at, second_at);
        // Moving toward 0.6 when the truth is 0 earns nothing.
        assert_eq!(second.2, Some(0.0));

        let report = scorer.run(t0() + Duration::days(95)).await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_unmeaningful_episodes_ignored() {
        let (pool, event) = setup(0.40, 0.41).await;
        sqlx::query("UPDATE alpha_episodes SET is_meaningful = 0")
            .execute(&pool)
            .await
            .unwrap();
        resolve_event(&pool, event, true).await.unwrap();

        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        let report = scorer.run(t0() + Duration::days(99)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(scores(&pool).await, (None, None, None));
    }

    #[tokio::test]
    async fn test_corrupt_event_is_skipped_not_fatal() {
        let pool = open_in_memory().await.unwrap();
        // Opened before any date chrono can represent.
        let broken: i64 = sqlx::query_scalar(
            "INSERT INTO events (title, opened_at, closes_at, outcome, market_prob)
             VALUES ('broken', -9000000000000, ?, 1, 0.5) RETURNING id",
        )
        .bind(to_db_time(t0()))
        .fetch_one(&pool)
        .await
        .unwrap();
        let healthy = insert_event(&pool, "ok", t0(), t0() + Duration::days(100), 0.4)
            .await
            .unwrap();
        resolve_event(&pool, healthy, true).await.unwrap();

        // The broken episode sorts first.
        for (update_id, event) in [(1, broken), (2, healthy)] {
            sqlx::query(
                "INSERT INTO alpha_episodes (market_update_id, post_id, event_id, trader_id, bucket_start,
                    episode_type, is_meaningful, p_before, p_after, created_at)
                 VALUES (?, 1, ?, 1, 0, 'attention', 1, 0.4, 0.6, 0)",
            )
            .bind(update_id)
            .bind(event)
            .execute(&pool)
            .await
            .unwrap();
        }

        let scorer = HorizonScorer::new(pool.clone(), SettlementConfig::default());
        let report = scorer.run(t0() + Duration::days(2)).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.final_scored, 1);

        let fin: Option<f64> = sqlx::query_scalar("SELECT s_final FROM alpha_episodes WHERE event_id = ?")
            .bind(healthy)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!((fin.unwrap() - 0.20).abs() < 1e-12);

        let untouched: Option<f64> = sqlx::query_scalar("SELECT s_final FROM alpha_episodes WHERE event_id = ?")
            .bind(broken)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(untouched, None);
    }
}
