//! Drift measurement over a compressed context.
//!
//! Diagnostic only: any judge failure yields [`DriftResult::Unmeasured`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::DriftJudge;
use crate::domain::{normalize_whitespace, CapabilityError};
use crate::protected_core::ProtectedCore;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftMeasurement {
    /// 0.0..=1.0
    pub goal_coherence: f64,
    /// Fraction of constraints recalled, 0.0..=1.0.
    pub constraint_recall: f64,
    /// 1..=5; `None` when no behaviour sample was supplied.
    pub behavior_alignment: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriftResult {
    Measured(DriftMeasurement),
    Unmeasured { reason: String },
}

impl DriftResult {
    pub fn measurement(&self) -> Option<&DriftMeasurement> {
        match self {
            Self::Measured(m) => Some(m),
            Self::Unmeasured { .. } => None,
        }
    }

    pub fn is_measured(&self) -> bool {
        matches!(self, Self::Measured(_))
    }
}

/// A recent agent response to judge for behavioural alignment.
#[derive(Debug, Clone, Copy)]
pub struct BehaviorSample<'a> {
    pub response: &'a str,
    pub test_context: &'a str,
}

fn present(haystack: &str, needle: &str) -> bool {
    let needle = normalize_whitespace(needle).to_lowercase();
    !needle.is_empty() && normalize_whitespace(haystack).to_lowercase().contains(&needle)
}

#[derive(Clone)]
pub struct DriftMeasurer {
    judge: Option<Arc<dyn DriftJudge>>,
    retry: RetryPolicy,
}

impl DriftMeasurer {
    pub fn new(judge: Option<Arc<dyn DriftJudge>>, retry: RetryPolicy) -> Self {
        Self { judge, retry }
    }

    pub async fn measure(
        &self,
        core: &ProtectedCore,
        compressed: &str,
        behavior: Option<BehaviorSample<'_>>,
    ) -> DriftResult {
        match self.try_measure(core, compressed, behavior).await {
            Ok(m) => {
                debug!(
                    goal_coherence = m.goal_coherence,
                    constraint_recall = m.constraint_recall,
                    behavior_alignment = ?m.behavior_alignment,
                    "drift measured"
                );
                DriftResult::Measured(m)
            }
            Err(err) => {
                warn!(error = %err, "drift measurement unavailable");
                DriftResult::Unmeasured {
                    reason: err.to_string(),
                }
            }
        }
    }

    fn judge(&self) -> Result<&Arc<dyn DriftJudge>, CapabilityError> {
        self.judge
            .as_ref()
            .ok_or_else(|| CapabilityError::Unavailable("no drift judge configured".into()))
    }

    async fn try_measure(
        &self,
        core: &ProtectedCore,
        compressed: &str,
        behavior: Option<BehaviorSample<'_>>,
    ) -> Result<DriftMeasurement, CapabilityError> {
        let goal = core.goal();
        let goal_coherence = if goal.is_empty() || present(compressed, goal) {
            1.0
        } else {
            let judge = self.judge()?;
            self.retry
                .run("judge_goal", || judge.goal_coherence(goal, compressed))
                .await?
        };

        let constraints = core.constraints();
        let constraint_recall = if constraints.is_empty() {
            1.0
        } else {
            let mut recalled = 0usize;
            for constraint in constraints {
                let hit = if present(compressed, constraint) {
                    true
                } else {
                    let judge = self.judge()?;
                    self.retry
                        .run("judge_constraint", || judge.constraint_recalled(constraint, compressed))
                        .await?
                };
                recalled += usize::from(hit);
            }
            recalled as f64 / constraints.len() as f64
        };

        let behavior_alignment = match behavior {
            None => None,
            Some(sample) if sample.response.trim().is_empty() => Some(1),
            Some(sample) => {
                let judge = self.judge()?;
                let score = self
                    .retry
                    .run("judge_behavior", || {
                        judge.behavior_alignment(goal, constraints, sample.response, sample.test_context)
                    })
                    .await?;
                Some(score.clamp(1, 5))
            }
        };

        Ok(DriftMeasurement {
            goal_coherence: clamp_unit(goal_coherence),
            constraint_recall: clamp_unit(constraint_recall),
            behavior_alignment,
        })
    }
}

fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

impl std::fmt::Debug for DriftMeasurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriftMeasurer")
            .field("judge", &self.judge.is_some())
            .field("retry", &self.retry)
            .finish()
    }
}
