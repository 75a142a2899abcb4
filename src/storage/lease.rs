//! Claim/process/release leasing for minting candidates.
//!
//! A worker claims a batch of episodes, mints them, then releases the
//! claim. Claims are exclusive while unexpired, so overlapping minting
//! passes split the candidate set between them instead of contending for
//! the same rows. A worker that dies mid-batch simply lets its lease
//! expire; the next pass picks the episodes up again.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use super::to_db_time;

/// Episodes held by one worker until `expires_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseBatch {
    pub token: String,
    pub episode_ids: Vec<i64>,
    pub expires_at: DateTime<Utc>,
}

impl LeaseBatch {
    pub fn is_empty(&self) -> bool {
        self.episode_ids.is_empty()
    }
}

/// Exclusive, expiring claims over minting candidates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EpisodeLease: Send + Sync {
    /// Claim up to `limit` unleased (or lease-expired) episodes that have a
    /// scored horizon without a payout.
    async fn claim(&self, limit: i64, now: DateTime<Utc>) -> Result<LeaseBatch>;

    /// Give the batch back. Returns how many episodes were still held.
    async fn release(&self, batch: &LeaseBatch) -> Result<u64>;

    /// How long a claim stays exclusive.
    fn ttl(&self) -> Duration;
}

/// Lease columns on `alpha_episodes`, claimed with a single atomic UPDATE.
pub struct SqliteEpisodeLease {
    pool: SqlitePool,
    ttl: Duration,
}

impl SqliteEpisodeLease {
    pub fn new(pool: SqlitePool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl EpisodeLease for SqliteEpisodeLease {
    async fn claim(&self, limit: i64, now: DateTime<Utc>) -> Result<LeaseBatch> {
        let token = Uuid::new_v4().to_string();
        let expires_at = now + self.ttl;

        // One statement: two concurrent claimers can never both match a row.
        sqlx::query(
            r#"
            UPDATE alpha_episodes
            SET lease_token = ?1, lease_expires_at = ?2
            WHERE id IN (
                SELECT e.id FROM alpha_episodes e
                WHERE e.is_meaningful = 1
                  AND (e.lease_token IS NULL OR e.lease_expires_at <= ?3)
                  AND (
                       (e.s_early IS NOT NULL AND NOT EXISTS (
                            SELECT 1 FROM alpha_payouts p
                            WHERE p.episode_id = e.id AND p.component = 'early'))
                    OR (e.s_mid IS NOT NULL AND NOT EXISTS (
                            SELECT 1 FROM alpha_payouts p
                            WHERE p.episode_id = e.id AND p.component = 'mid'))
                    OR (e.s_final IS NOT NULL AND NOT EXISTS (
                            SELECT 1 FROM alpha_payouts p
                            WHERE p.episode_id = e.id AND p.component = 'final'))
                  )
                ORDER BY e.id
                LIMIT ?4
            )
            "#,
        )
        .bind(&token)
        .bind(to_db_time(expires_at))
        .bind(to_db_time(now))
        .bind(limit)
        .execute(&self.pool)
        .await
        .context("Failed to claim minting candidates")?;

        let episode_ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM alpha_episodes WHERE lease_token = ? ORDER BY id",
        )
        .bind(&token)
        .fetch_all(&self.pool)
        .await?;

        debug!(token = %token, claimed = episode_ids.len(), "Lease claimed");

        Ok(LeaseBatch {
            token,
            episode_ids,
            expires_at,
        })
    }

    async fn release(&self, batch: &LeaseBatch) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE alpha_episodes SET lease_token = NULL, lease_expires_at = NULL WHERE lease_token = ?",
        )
        .bind(&batch.token)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to release lease {}", batch.token))?;

        debug!(token = %batch.token, released = result.rows_affected(), "Lease released");
        Ok(result.rows_affected())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
