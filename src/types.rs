//! Shared types for the settlement pipeline.
//!
//! These types form the data model used across all modules. Storage rows
//! are converted into these at the edge of each engine component so the
//! scoring and minting logic never touches raw SQL values.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Episode classification
// ---------------------------------------------------------------------------

/// Whether the trader already held a position when the post moved them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    /// Trader held a prior position: the post changed an existing belief.
    Belief,
    /// First position on the event: the post drew fresh attention.
    Attention,
}

impl EpisodeType {
    pub fn from_prior_position(had_prior_position: bool) -> Self {
        if had_prior_position {
            EpisodeType::Belief
        } else {
            EpisodeType::Attention
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeType::Belief => "belief",
            EpisodeType::Attention => "attention",
        }
    }
}

impl fmt::Display for EpisodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeType {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "belief" => Ok(EpisodeType::Belief),
            "attention" => Ok(EpisodeType::Attention),
            other => Err(SettlementError::CorruptRow(format!(
                "unknown episode_type: {other}"
            ))),
        }
    }
}

/// Scoring checkpoint. Also the payout component key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Horizon {
    Early,
    Mid,
    Final,
}

impl Horizon {
    pub const ALL: [Horizon; 3] = [Horizon::Early, Horizon::Mid, Horizon::Final];

    pub fn as_str(&self) -> &'static str {
        match self {
            Horizon::Early => "early",
            Horizon::Mid => "mid",
            Horizon::Final => "final",
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "early" => Ok(Horizon::Early),
            "mid" => Ok(Horizon::Mid),
            "final" => Ok(Horizon::Final),
            other => Err(SettlementError::CorruptRow(format!(
                "unknown payout component: {other}"
            ))),
        }
    }
}

/// Terminal state of a payout row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    /// Credited (possibly zero, possibly clipped to the remaining cap).
    Minted,
    /// Cap already exhausted. Settled, never retried.
    SkippedByCap,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Minted => "minted",
            PayoutStatus::SkippedByCap => "skipped_by_cap",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minted" => Ok(PayoutStatus::Minted),
            "skipped_by_cap" => Ok(PayoutStatus::SkippedByCap),
            other => Err(SettlementError::CorruptRow(format!(
                "unknown payout_status: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One probability-changing trade, as read from the market.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketUpdate {
    pub id: i64,
    pub event_id: i64,
    pub trader_id: i64,
    pub prev_prob: f64,
    pub new_prob: f64,
    /// Stake in ledger units.
    pub stake_ledger: i64,
    pub had_prior_position: bool,
    pub referral_post_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl MarketUpdate {
    /// Absolute probability move caused by the trade.
    pub fn prob_delta(&self) -> f64 {
        (self.new_prob - self.prev_prob).abs()
    }
}

/// Probabilities and scores are compared and minted at this many decimal
/// places, which drops binary floating-point noise such as
/// `0.45 - 0.40 = 0.04999999999999999`.
pub const SCORE_DP: u32 = 12;

/// `value` as a `Decimal` rounded to [`SCORE_DP`]. `None` for non-finite or
/// out-of-range input.
pub fn snap_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).map(|d| d.round_dp(SCORE_DP))
}

/// The attribution unit linking one trade to the post credited with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub market_update_id: i64,
    pub post_id: i64,
    pub event_id: i64,
    pub trader_id: i64,
    pub bucket_start: DateTime<Utc>,
    pub episode_type: EpisodeType,
    pub is_meaningful: bool,
    pub p_before: f64,
    pub p_after: f64,
    pub s_early: Option<f64>,
    pub s_early_at: Option<DateTime<Utc>>,
    pub s_mid: Option<f64>,
    pub s_mid_at: Option<DateTime<Utc>>,
    pub s_final: Option<f64>,
    pub s_final_at: Option<DateTime<Utc>>,
    pub combined_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    /// Score recorded for a horizon, if any.
    pub fn score(&self, horizon: Horizon) -> Option<f64> {
        match horizon {
            Horizon::Early => self.s_early,
            Horizon::Mid => self.s_mid,
            Horizon::Final => self.s_final,
        }
    }

    pub fn is_fully_scored(&self) -> bool {
        Horizon::ALL.iter().all(|h| self.score(*h).is_some())
    }
}

/// Event timing and resolution, as needed for scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventWindow {
    pub id: i64,
    pub opened_at: DateTime<Utc>,
    pub closes_at: DateTime<Utc>,
    pub outcome: Option<bool>,
    /// Current live probability.
    pub market_prob: f64,
}

/// One settled payout component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payout {
    pub id: i64,
    pub episode_id: i64,
    pub component: Horizon,
    pub post_id: i64,
    pub author_id: i64,
    pub event_id: i64,
    pub score_component: f64,
    pub mint_rate: f64,
    pub reward_ledger: i64,
    pub payout_status: PayoutStatus,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the settlement pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Post {post_id} referenced by episode {episode_id} does not exist")]
    UnknownPost { episode_id: i64, post_id: i64 },

    #[error("Author {author_id} of post {post_id} has no ledger account")]
    UnknownAuthor { author_id: i64, post_id: i64 },

    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    #[error("Lease {token} no longer held")]
    LeaseLost { token: String },

    #[error("Reward arithmetic overflow: {0}")]
    RewardOverflow(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
