//! Configuration loading from TOML with environment variable overrides.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. The
//! settlement parameters are validated once at load time and then passed
//! by value into each engine component; nothing reads configuration after
//! startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

use crate::types::SettlementError;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Parameters of the settlement pipeline.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SettlementConfig {
    /// Master switch. When false every batch is recorded as skipped.
    pub enabled: bool,
    /// Minimum |p_after - p_before| for an episode to be meaningful.
    pub min_prob_delta: f64,
    /// Minimum stake (ledger units) for an episode to be meaningful.
    pub min_stake_ledger: i64,
    /// Early horizon as a fraction of the event's open-to-close duration.
    pub first_horizon_fraction: f64,
    /// Mid horizon as a fraction of the event's open-to-close duration.
    pub second_horizon_fraction: f64,
    pub early_weight: f64,
    pub mid_weight: f64,
    pub final_weight: f64,
    pub belief_multiplier: f64,
    pub attention_multiplier: f64,
    /// Ledger units minted per point of component score.
    pub mint_rate_ledger_per_point: f64,
    pub cap_per_post_per_day_ledger: i64,
    pub cap_per_author_per_day_ledger: i64,
    /// Upper bound on market updates handled per build pass.
    pub build_batch_size: i64,
    /// Upper bound on episodes examined per scoring pass.
    pub score_batch_size: i64,
    /// Upper bound on episodes claimed per minting pass.
    pub mint_batch_size: i64,
    /// Lifetime of a minting lease before another worker may reclaim it.
    pub lease_ttl_secs: i64,
    /// Number of event shards the build queue is split across.
    pub shard_count: i64,
    /// Shard served by this process (`event_id % shard_count`).
    pub shard_index: i64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_prob_delta: 0.05,
            min_stake_ledger: 100,
            first_horizon_fraction: 0.25,
            second_horizon_fraction: 0.50,
            early_weight: 0.2,
            mid_weight: 0.3,
            final_weight: 0.5,
            belief_multiplier: 1.0,
            attention_multiplier: 0.5,
            mint_rate_ledger_per_point: 1000.0,
            cap_per_post_per_day_ledger: 5_000,
            cap_per_author_per_day_ledger: 20_000,
            build_batch_size: 500,
            score_batch_size: 1_000,
            mint_batch_size: 200,
            lease_ttl_secs: 300,
            shard_count: 1,
            shard_index: 0,
        }
    }
}

impl SettlementConfig {
    /// Reject parameter combinations the pipeline cannot honour.
    pub fn validate(&self) -> Result<(), SettlementError> {
        let first = self.first_horizon_fraction;
        let second = self.second_horizon_fraction;
        if !(first > 0.0 && first < second && second < 1.0) {
            return Err(SettlementError::Config(format!(
                "horizon fractions must satisfy 0 < first < second < 1 (got {first}, {second})"
            )));
        }

        if !(0.0..=1.0).contains(&self.min_prob_delta) {
            return Err(SettlementError::Config(format!(
                "min_prob_delta must be within [0, 1] (got {})",
                self.min_prob_delta
            )));
        }

        let non_negative = [
            ("early_weight", self.early_weight),
            ("mid_weight", self.mid_weight),
            ("final_weight", self.final_weight),
            ("belief_multiplier", self.belief_multiplier),
            ("attention_multiplier", self.attention_multiplier),
            ("mint_rate_ledger_per_point", self.mint_rate_ledger_per_point),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SettlementError::Config(format!(
                    "{name} must be a finite non-negative number (got {value})"
                )));
            }
        }

        let non_negative_ledger = [
            ("min_stake_ledger", self.min_stake_ledger),
            ("cap_per_post_per_day_ledger", self.cap_per_post_per_day_ledger),
            ("cap_per_author_per_day_ledger", self.cap_per_author_per_day_ledger),
        ];
        for (name, value) in non_negative_ledger {
            if value < 0 {
                return Err(SettlementError::Config(format!(
                    "{name} must not be negative (got {value})"
                )));
            }
        }

        let positive = [
            ("build_batch_size", self.build_batch_size),
            ("score_batch_size", self.score_batch_size),
            ("mint_batch_size", self.mint_batch_size),
            ("lease_ttl_secs", self.lease_ttl_secs),
            ("shard_count", self.shard_count),
        ];
        for (name, value) in positive {
            if value <= 0 {
                return Err(SettlementError::Config(format!(
                    "{name} must be positive (got {value})"
                )));
            }
        }

        if self.shard_index < 0 || self.shard_index >= self.shard_count {
            return Err(SettlementError::Config(format!(
                "shard_index {} out of range for shard_count {}",
                self.shard_index, self.shard_count
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Create the market/post/user tables when missing (local runs only).
    pub create_collaborator_tables: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://alpha_settlement.db".to_string(),
            max_connections: 4,
            create_collaborator_tables: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8087,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        Ok(config)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.settlement.validate()?;
        Ok(config)
    }
}
