//! Persuasive-alpha settlement.
//!
//! Rewards post authors whose referred trades moved a market toward the
//! eventual answer. Library crate exposing all modules for use by
//! integration tests and the binary entry point.

pub mod admin;
pub mod config;
pub mod engine;
pub mod storage;
pub mod types;
