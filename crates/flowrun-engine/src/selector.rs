use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info};

use flowrun_core::error::{FlowError, Result};
use flowrun_core::traits::{ProfileSource, SemanticOracle};
use flowrun_core::types::AgentProfile;
use flowrun_core::workflow::{AgentSelection, SelectionCriteria};

use crate::oracle;

/// Workload at or above which a worker is penalised when criteria omit one.
pub const DEFAULT_MAX_WORKLOAD: u32 = 10;

/// Profiles fixed at startup (from configuration).
pub struct StaticProfiles {
    profiles: Vec<AgentProfile>,
}

impl StaticProfiles {
    pub fn new(profiles: Vec<AgentProfile>) -> Self {
        Self { profiles }
    }
}

impl ProfileSource for StaticProfiles {
    fn profiles(&self) -> BoxFuture<'_, Result<Vec<AgentProfile>>> {
        Box::pin(async move { Ok(self.profiles.clone()) })
    }
}

/// Score a worker against selection criteria. Higher is better.
///
/// Starts at 100; skills add up to 30 by match ratio; a worker at or over
/// the workload threshold loses 20; below the minimum success rate loses 30,
/// otherwise gains 50 per point of success rate above the minimum.
pub fn score(profile: &AgentProfile, criteria: &SelectionCriteria) -> f64 {
    let mut score = 100.0;

    if !criteria.required_skills.is_empty() {
        let matched = criteria
            .required_skills
            .iter()
            .filter(|skill| {
                profile
                    .skills
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(skill))
            })
            .count();
        score += 30.0 * matched as f64 / criteria.required_skills.len() as f64;
    }

    let max_workload = criteria.max_workload.unwrap_or(DEFAULT_MAX_WORKLOAD);
    if profile.active_tasks >= max_workload {
        score -= 20.0;
    }

    let min_success = criteria.min_success_rate.unwrap_or(0.0);
    if profile.success_rate < min_success {
        score -= 30.0;
    } else {
        score += 50.0 * (profile.success_rate - min_success);
    }

    score
}

/// Pick the best-scoring worker. Ties go to the first encountered.
pub fn best_match<'a>(
    eligible: &'a [AgentProfile],
    criteria: &SelectionCriteria,
) -> Option<(&'a AgentProfile, f64)> {
    let mut best: Option<(&AgentProfile, f64)> = None;
    for profile in eligible {
        let s = score(profile, criteria);
        debug!(agent = %profile.name, score = s, "Scored agent");
        if best.map_or(true, |(_, top)| s > top) {
            best = Some((profile, s));
        }
    }
    best
}

/// Chooses which worker handles an agent node.
pub struct AgentSelector {
    profiles: Arc<dyn ProfileSource>,
    oracle: Option<Arc<dyn SemanticOracle>>,
}

impl AgentSelector {
    pub fn new(profiles: Arc<dyn ProfileSource>, oracle: Option<Arc<dyn SemanticOracle>>) -> Self {
        Self { profiles, oracle }
    }

    /// Eligible workers in candidate order (every profile if no candidates).
    async fn eligible(&self, selection: &AgentSelection) -> Result<Vec<AgentProfile>> {
        let all = self.profiles.profiles().await?;
        if selection.candidates.is_empty() {
            return Ok(all);
        }
        Ok(selection
            .candidates
            .iter()
            .filter_map(|name| all.iter().find(|p| &p.name == name).cloned())
            .collect())
    }

    /// Resolve a worker name. `Ok(None)` means nobody is eligible.
    pub async fn select(&self, selection: &AgentSelection, task: &str) -> Result<Option<String>> {
        let eligible = self.eligible(selection).await?;
        if eligible.is_empty() {
            return Ok(None);
        }

        match &selection.criteria {
            Some(criteria) => {
                let chosen = best_match(&eligible, criteria).map(|(p, s)| {
                    info!(agent = %p.name, score = s, "Selected agent by criteria");
                    p.name.clone()
                });
                Ok(chosen)
            }
            None => self.select_semantic(&eligible, selection, task).await.map(Some),
        }
    }

    async fn select_semantic(
        &self,
        eligible: &[AgentProfile],
        selection: &AgentSelection,
        task: &str,
    ) -> Result<String> {
        let oracle = self
            .oracle
            .as_deref()
            .ok_or_else(|| FlowError::Oracle("no semantic oracle configured".into()))?;

        let roster = eligible
            .iter()
            .map(|p| {
                format!(
                    "- {}: strengths [{}], specialties [{}], success rate {:.0}%",
                    p.name,
                    p.strengths.join(", "),
                    p.specialties.join(", "),
                    p.success_rate * 100.0
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let task = selection.task.as_deref().unwrap_or(task);
        let name = oracle::choose(oracle, task, &roster).await?;

        if eligible.iter().any(|p| p.name == name) {
            info!(agent = %name, "Selected agent by oracle");
            Ok(name)
        } else {
            Err(FlowError::InvalidSelection { name })
        }
    }
}
