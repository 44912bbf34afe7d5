//! Rating plan resolution
//!
//! Turns a call descriptor into the ordered list of [`RatingInfo`] covering
//! its window. Profiles are looked up by `(direction, category, subject)`,
//! falling back to the `*any` subject, and each activation's plan is matched
//! against the dialed number by longest prefix. Segments a plan cannot rate
//! are retried through the activation's fallback subjects.

use std::collections::HashSet;
use std::sync::Arc;

use apolo_core::constants::{ANY, FALLBACK_SUBJECT, RECURSION_MAX_DEPTH};
use apolo_core::models::{CallDescriptor, RateInterval, RatingInfo, RatingPlan, RatingProfile};
use apolo_core::utils::split_prefix;
use apolo_core::{AppError, AppResult};
use apolo_store::{CacheMode, Catalog};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, instrument, warn};

use crate::settings::RatingSettings;

/// Profile lookup coordinates shared by every recursion level
struct Lookup<'a> {
    tenant: &'a str,
    direction: &'a str,
    category: &'a str,
    destination: &'a str,
}

pub struct RatingResolver {
    catalog: Arc<Catalog>,
    settings: RatingSettings,
}

impl RatingResolver {
    pub fn new(catalog: Arc<Catalog>, settings: RatingSettings) -> Self {
        Self { catalog, settings }
    }

    /// Rating infos covering `[cd.time_start, cd.time_end)`, oldest first
    ///
    /// # Errors
    ///
    /// Returns `AppError::UnauthorizedDestination` when no profile, plan or
    /// fallback rates the whole window.
    #[instrument(skip(self, cd), fields(account = %cd.account_key(), destination = %cd.destination))]
    pub async fn resolve(&self, cd: &CallDescriptor) -> AppResult<Vec<RatingInfo>> {
        let category = if cd.category.is_empty() {
            self.settings.default_category.as_str()
        } else {
            cd.category.as_str()
        };
        let lookup = Lookup {
            tenant: &cd.tenant,
            direction: &cd.direction,
            category,
            destination: &cd.destination,
        };

        let mut infos = self
            .resolve_subject(&lookup, cd.subject_name(), cd.time_start, cd.time_end, 0, HashSet::new())
            .await?;
        if infos.is_none() && cd.subject_name() != FALLBACK_SUBJECT {
            debug!("No profile for subject {}, trying {}", cd.subject_name(), FALLBACK_SUBJECT);
            infos = self
                .resolve_subject(&lookup, FALLBACK_SUBJECT, cd.time_start, cd.time_end, 0, HashSet::new())
                .await?;
        }

        let infos = infos.unwrap_or_default();
        if !is_continuous(&infos, cd.time_start) {
            warn!("Destination {} not rated for {}", cd.destination, cd.account_key());
            return Err(AppError::UnauthorizedDestination(cd.destination.clone()));
        }
        Ok(infos)
    }

    /// Infos of `subject` over `[start, end)`, `None` when it has no profile
    fn resolve_subject<'a>(
        &'a self,
        lookup: &'a Lookup<'a>,
        subject: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        depth: usize,
        mut visited: HashSet<String>,
    ) -> BoxFuture<'a, AppResult<Option<Vec<RatingInfo>>>> {
        async move {
            if depth > RECURSION_MAX_DEPTH || !visited.insert(subject.to_string()) {
                debug!("Stopped fallback chain at {} (depth {})", subject, depth);
                return Ok(None);
            }
            let key = RatingProfile::profile_key(lookup.direction, lookup.category, subject);
            let Some(profile) = self
                .catalog
                .find::<RatingProfile>(lookup.tenant, &key, CacheMode::UseCache)
                .await?
            else {
                return Ok(None);
            };

            let mut infos = self.activation_infos(lookup, &profile, start, end).await?;

            // Retry every segment the plans could not rate through its fallbacks
            let mut i = 0;
            while i < infos.len() {
                if infos[i].is_rated() {
                    i += 1;
                    continue;
                }
                let seg_start = infos[i].activation_time.max(start);
                let seg_end = infos
                    .get(i + 1)
                    .map(|next| next.activation_time)
                    .unwrap_or(end);
                let fallbacks = infos[i].fallback_subjects.clone();
                let mut step = 1;
                for fallback in &fallbacks {
                    let Some(mut spliced) = self
                        .resolve_subject(lookup, fallback, seg_start, seg_end, depth + 1, visited.clone())
                        .await?
                    else {
                        continue;
                    };
                    if !is_continuous(&spliced, seg_start) {
                        continue;
                    }
                    spliced[0].activation_time = seg_start;
                    debug!("Segment at {} rated through fallback {}", seg_start, fallback);
                    step = spliced.len();
                    infos.splice(i..=i, spliced);
                    break;
                }
                i += step;
            }
            Ok(Some(infos))
        }
        .boxed()
    }

    async fn activation_infos(
        &self,
        lookup: &Lookup<'_>,
        profile: &RatingProfile,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<Vec<RatingInfo>> {
        let mut infos = Vec::new();
        for (index, activation) in profile.active_for_call(start, end).into_iter().enumerate() {
            let Some(plan) = self
                .catalog
                .find::<RatingPlan>(lookup.tenant, &activation.rating_plan_id, CacheMode::UseCache)
                .await?
            else {
                warn!(
                    "Rating plan {} of {} not found",
                    activation.rating_plan_id,
                    profile.full_id()
                );
                continue;
            };

            if index == 0 && start < activation.activation_time {
                infos.push(RatingInfo {
                    activation_time: start,
                    fallback_subjects: vec![FALLBACK_SUBJECT.to_string()],
                    ..Default::default()
                });
            }

            match self.match_plan(&plan, lookup.destination) {
                Some((code, name, intervals)) => infos.push(RatingInfo {
                    matched_subject: profile.full_id(),
                    rating_plan_id: plan.name.clone(),
                    matched_prefix: code,
                    matched_dest_id: name,
                    activation_time: activation.activation_time,
                    rate_intervals: intervals,
                    fallback_subjects: activation.fallback_subjects.clone(),
                }),
                None if !activation.fallback_subjects.is_empty() => infos.push(RatingInfo {
                    activation_time: activation.activation_time,
                    fallback_subjects: activation.fallback_subjects.clone(),
                    ..Default::default()
                }),
                None => debug!("Plan {} does not rate {}", plan.name, lookup.destination),
            }
        }
        Ok(infos)
    }

    /// Longest prefix of `destination` rated by `plan`, else its `*any` entry
    fn match_plan(
        &self,
        plan: &RatingPlan,
        destination: &str,
    ) -> Option<(String, String, Vec<RateInterval>)> {
        if destination != ANY && !destination.is_empty() {
            for prefix in split_prefix(destination, self.settings.min_prefix_match) {
                if let Some((intervals, name)) = plan.rate_interval_list(prefix) {
                    return Some((prefix.to_string(), name.to_string(), intervals));
                }
            }
        }
        plan.rate_interval_list(ANY)
            .map(|(intervals, _)| (ANY.to_string(), ANY.to_string(), intervals))
    }
}

/// True when the infos rate the whole window starting at `start`
fn is_continuous(infos: &[RatingInfo], start: DateTime<Utc>) -> bool {
    match infos.first() {
        Some(first) => first.activation_time <= start && infos.iter().all(RatingInfo::is_rated),
        None => false,
    }
}
