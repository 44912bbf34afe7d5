//! Apolo Rating Library
//!
//! Real-time rating and balance debiting on top of the Apolo catalog and
//! account stores:
//!
//! - Destination matching and rating plan resolution
//! - Time-span splitting and increment pricing
//! - The debit engine with unit, money and shared-group balances
//! - Counters, action triggers and the action runtime with its notifiers
//! - The action planner and its scheduler
//! - Session quoting and refunds through [`Rater`]
//!
//! Every mutation of an account runs under the [`Guardian`], which
//! serializes work per account key.

pub mod actions;
pub mod candidates;
pub mod debit;
pub mod guardian;
pub mod ledger;
pub mod matcher;
pub mod notify;
pub mod planner;
pub mod rater;
pub mod resolver;
pub mod settings;
pub mod timespans;
pub mod triggers;

#[cfg(test)]
mod fixtures;

pub use actions::{ActionContext, ActionOutcome, ActionRuntime};
pub use debit::{DebitOptions, Debiter};
pub use guardian::Guardian;
pub use ledger::Ledger;
pub use planner::{ActionPlanner, Scheduler, TimingStatus};
pub use rater::Rater;
pub use settings::{ActionSettings, RatingSettings};
pub use timespans::CostEngine;
pub use triggers::{QueuedTrigger, TriggerProcessor};
