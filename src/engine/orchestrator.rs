//! One settlement batch: build → score → mint → log.
//!
//! Phases are independent and idempotent, so a failing phase is recorded and
//! the remaining phases still run. The run log row is written on every path.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use std::time::Instant;
use tracing::{error, info, warn};

use super::builder::EpisodeBuilder;
use super::minter::PayoutMinter;
use super::run_log::{RunLogger, RunStatus, RunSummary};
use super::scorer::HorizonScorer;
use crate::config::SettlementConfig;
use crate::storage::lease::{EpisodeLease, SqliteEpisodeLease};

pub struct BatchOrchestrator {
    config: SettlementConfig,
    builder: EpisodeBuilder,
    scorer: HorizonScorer,
    minter: PayoutMinter,
    logger: RunLogger,
}

impl BatchOrchestrator {
    /// Wire every phase to the same pool with the SQLite lease.
    pub fn new(pool: SqlitePool, config: SettlementConfig) -> Self {
        let lease = SqliteEpisodeLease::new(pool.clone(), Duration::seconds(config.lease_ttl_secs));
        Self::with_lease(pool, config, Box::new(lease))
    }

    pub fn with_lease(
        pool: SqlitePool,
        config: SettlementConfig,
        lease: Box<dyn EpisodeLease>,
    ) -> Self {
        Self {
            builder: EpisodeBuilder::new(pool.clone(), config.clone()),
            scorer: HorizonScorer::new(pool.clone(), config.clone()),
            minter: PayoutMinter::new(pool.clone(), config.clone(), lease),
            logger: RunLogger::new(pool),
            config,
        }
    }

    pub fn logger(&self) -> &RunLogger {
        &self.logger
    }

    /// Run one batch as of `now`.
    ///
    /// Phase errors never escape: they land in the summary's event trail and
    /// turn the run `failed`. Only a failure to write the run log itself is
    /// returned as an error.
    pub async fn run_batch(&self, now: DateTime<Utc>) -> Result<RunSummary> {
        let clock = Instant::now();
        let mut summary = RunSummary::new(now);

        if !self.config.enabled {
            summary.status = RunStatus::Skipped;
            summary.note("settlement disabled");
            info!("Settlement disabled, skipping batch");
        } else {
            match self.builder.run(now).await {
                Ok(report) => summary.build = report,
                Err(e) => {
                    error!(error = %e, "Episode build phase failed");
                    summary.phase_failed("build", &e);
                }
            }

            match self.scorer.run(now).await {
                Ok(report) => summary.score = report,
                Err(e) => {
                    error!(error = %e, "Scoring phase failed");
                    summary.phase_failed("score", &e);
                }
            }

            match self.minter.run(now).await {
                Ok(report) => summary.mint = report,
                Err(e) => {
                    error!(error = %e, "Minting phase failed, batch rolled back");
                    summary.phase_failed("mint", &e);
                }
            }

            summary.status = if summary.error_count > 0 {
                RunStatus::Failed
            } else {
                RunStatus::Completed
            };
        }

        let elapsed = clock.elapsed();
        summary.duration_ms = elapsed.as_millis() as i64;
        summary.finished_at = now + Duration::milliseconds(summary.duration_ms);

        match self.logger.record(&summary).await {
            Ok(run_id) => summary.run_id = Some(run_id),
            Err(e) => {
                warn!(error = %e, "Run log write failed");
                return Err(e);
            }
        }

        info!(
            run_id = summary.run_id,
            status = %summary.status,
            built = summary.build.created,
            scored = summary.score.early_scored + summary.score.mid_scored + summary.score.final_scored,
            minted = summary.mint.minted,
            ledger = summary.mint.ledger_minted,
            errors = summary.error_count,
            duration_ms = summary.duration_ms,
            "Settlement batch finished"
        );
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::collaborators::{
        insert_event, insert_market_update, insert_post, insert_user, ledger_balance,
        resolve_event, NewMarketUpdate,
    };
    use crate::storage::lease::MockEpisodeLease;
    use crate::storage::open_in_memory;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap()
    }

    async fn seed(pool: &SqlitePool) -> (i64, i64) {
        let author = insert_user(pool, "author").await.unwrap();
        let trader = insert_user(pool, "trader").await.unwrap();
        let post = insert_post(pool, author).await.unwrap();
        let event = insert_event(pool, "launch", t0(), t0() + Duration::days(100), 0.40)
            .await
            .unwrap();
        insert_market_update(
            pool,
            &NewMarketUpdate {
                event_id: event,
                trader_id: trader,
                prev_prob: 0.40,
                new_prob: 0.60,
                stake_ledger: 500,
                had_prior_position: false,
                referral_post_id: Some(post),
                created_at: t0() + Duration::hours(1),
            },
        )
        .await
        .unwrap();
        (author, event)
    }

    #[tokio::test]
    async fn test_disabled_run_is_logged_as_skipped() {
        let pool = open_in_memory().await.unwrap();
        seed(&pool).await;
        let config = SettlementConfig {
            enabled: false,
            ..Default::default()
        };
        let orchestrator = BatchOrchestrator::new(pool.clone(), config);

        let summary = orchestrator.run_batch(t0() + Duration::days(1)).await.unwrap();
        assert_eq!(summary.status, RunStatus::Skipped);
        assert_eq!(summary.build.pulled, 0);

        let episodes: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alpha_episodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(episodes, 0);

        let runs = orchestrator.logger().recent(5).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Skipped);
    }

    #[tokio::test]
    async fn test_full_batch_settles_final_horizon() {
        let pool = open_in_memory().await.unwrap();
        let (author, event) = seed(&pool).await;
        resolve_event(&pool, event, true).await.unwrap();

        let orchestrator = BatchOrchestrator::new(pool.clone(), SettlementConfig::default());
        let summary = orchestrator.run_batch(t0() + Duration::days(1)).await.unwrap();

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.build.created, 1);
        assert_eq!(summary.score.final_scored, 1);
        assert_eq!(summary.score.early_scored, 0);
        // attention 0.5 × final 0.5 × 0.20 × 1000
        assert_eq!(summary.mint.ledger_minted, 50);
        assert_eq!(ledger_balance(&pool, author).await.unwrap(), Some(50));

        let again = orchestrator.run_batch(t0() + Duration::days(1)).await.unwrap();
        assert_eq!(again.status, RunStatus::Completed);
        assert_eq!(again.build.created, 0);
        assert_eq!(again.mint.minted, 0);
        assert_eq!(ledger_balance(&pool, author).await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_mint_failure_does_not_stop_earlier_phases() {
        let pool = open_in_memory().await.unwrap();
        let (_, event) = seed(&pool).await;
        resolve_event(&pool, event, true).await.unwrap();

        let mut lease = MockEpisodeLease::new();
        lease
            .expect_claim()
            .returning(|_, _| Err(anyhow::anyhow!("lease store unavailable")));
        let orchestrator =
            BatchOrchestrator::with_lease(pool.clone(), SettlementConfig::default(), Box::new(lease));

        let summary = orchestrator.run_batch(t0() + Duration::days(1)).await.unwrap();
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.build.created, 1);
        assert_eq!(summary.score.final_scored, 1);
        assert_eq!(summary.events, vec!["mint: lease store unavailable".to_string()]);

        let runs = orchestrator.logger().recent(1).await.unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert_eq!(runs[0].run_id, summary.run_id);
    }
}
