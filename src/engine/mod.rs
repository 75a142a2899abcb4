//! Settlement engine: episode building, horizon scoring, payout minting and
//! the batch orchestrator that sequences them.

pub mod builder;
pub mod minter;
pub mod orchestrator;
pub mod run_log;
pub mod scorer;

pub use builder::{BuildReport, EpisodeBuilder};
pub use minter::{MintReport, PayoutMinter};
pub use orchestrator::BatchOrchestrator;
pub use run_log::{RunLogger, RunStatus, RunSummary};
pub use scorer::{HorizonScorer, ScoreReport};
