//! CLI commands for the candle adapter.

pub mod backfill;
pub mod run;

pub use backfill::{run_backfill, BackfillArgs};
pub use run::{run_feed, RunArgs};
