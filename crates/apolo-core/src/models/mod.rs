//! Domain models for the rating engine
//!
//! Catalog entities (destinations, timings, rates, rating plans and
//! profiles, shared groups, actions, triggers, plans), subscriber state
//! (accounts, balances, counters) and the transient request/response types
//! of the rating pipeline.

pub mod account;
pub mod action;
pub mod action_plan;
pub mod balance;
pub mod call;
pub mod cdr;
pub mod counter;
pub mod destination;
pub mod rate;
pub mod rating_plan;
pub mod shared_group;
pub mod stats;
pub mod timespan;
pub mod timing;
pub mod trigger;

pub use account::{Account, AccountSummary};
pub use action::{Action, ActionGroup, ActionKind, ActionParams, BalanceSpec};
pub use action_plan::{ActionPlan, ActionPlanBinding, ActionTiming, Task};
pub use balance::{Balance, BalanceRef, BalanceSummary, TypedBalance};
pub use call::{CallCost, CallDescriptor};
pub use cdr::Cdr;
pub use counter::{CounterEvent, CounterFilter, CounterType, UnitCounter};
pub use destination::{Destination, DestinationMatch};
pub use rate::{DestinationRate, DestinationRateBinding, MaxCostStrategy, RIRate, Rate, RateInterval, RateSlot};
pub use rating_plan::{RatingInfo, RatingPlan, RatingPlanActivation, RatingProfile};
pub use shared_group::{SharedGroup, SharingParameters, SharingStrategy};
pub use stats::StatsSnapshot;
pub use timespan::{DebitInfo, Increment, MonetaryInfo, TimeSpan, UnitInfo};
pub use timing::{RITiming, Timing};
pub use trigger::{ActionTrigger, ActionTriggerGroup, ActionTriggerRecord, ThresholdType};
