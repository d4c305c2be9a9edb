//! Early termination policies.
//!
//! A policy is consulted every time a Running trial reports its primary
//! metric. It sees the trial and a snapshot of every record in the store and
//! answers whether the trial should be cancelled.
//!
//! Checkpoints are the 1-based report counts of the primary metric, so the
//! third report of one trial is compared with the third report of the others.
//! The caller passes the step of the report being judged; the record may
//! already hold later points, which are ignored. Policies only evaluate at
//! steps that are multiples of `evaluation_interval` and past
//! `delay_evaluation`.

use std::sync::Arc;

use hs_types::{Objective, PolicyConfig, TrialRecord, TrialStatus};

/// Trait for pluggable early termination strategies.
pub trait EarlyTerminationPolicy: Send + Sync {
    /// Decide whether `trial` should be cancelled at checkpoint `step` given
    /// every record in the store.
    fn should_cancel(
        &self,
        trial: &TrialRecord,
        step: u64,
        all: &[TrialRecord],
        objective: &Objective,
    ) -> bool;

    fn name(&self) -> &str;
}

/// Build the policy described by `config`.
pub fn build_policy(config: &PolicyConfig) -> Arc<dyn EarlyTerminationPolicy> {
    match *config {
        PolicyConfig::Bandit {
            slack_factor,
            slack_amount,
            evaluation_interval,
            delay_evaluation,
        } => {
            let slack = match (slack_factor, slack_amount) {
                (Some(factor), _) => Slack::Factor(factor),
                (None, Some(amount)) => Slack::Amount(amount),
                (None, None) => Slack::Factor(0.0),
            };
            Arc::new(BanditPolicy {
                slack,
                gate: Gate::new(evaluation_interval, delay_evaluation),
            })
        }
        PolicyConfig::MedianStopping {
            evaluation_interval,
            delay_evaluation,
        } => Arc::new(MedianStoppingPolicy {
            gate: Gate::new(evaluation_interval, delay_evaluation),
        }),
        PolicyConfig::TruncationSelection {
            truncation_percentage,
            evaluation_interval,
            delay_evaluation,
        } => Arc::new(TruncationSelectionPolicy {
            truncation_percentage,
            gate: Gate::new(evaluation_interval, delay_evaluation),
        }),
    }
}

/// Interval/delay gating shared by every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Gate {
    interval: u64,
    delay: u64,
}

impl Gate {
    fn new(interval: u64, delay: u64) -> Self {
        Self {
            interval: interval.max(1),
            delay,
        }
    }

    /// Whether a report at `step` is an evaluation point.
    fn admits(&self, step: u64) -> bool {
        step > 0 && step > self.delay && step % self.interval == 0
    }
}

/// Running or completed trials that have reached `step`.
fn peers_at<'a>(
    all: &'a [TrialRecord],
    metric: &'a str,
    step: u64,
) -> impl Iterator<Item = &'a TrialRecord> + 'a {
    all.iter().filter(move |record| {
        matches!(record.status, TrialStatus::Running | TrialStatus::Completed)
            && record.latest_step(metric) >= step
    })
}

// ---- Never ----

/// Never cancels anything. Equivalent to running without a policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

impl EarlyTerminationPolicy for NeverCancel {
    fn should_cancel(&self, _: &TrialRecord, _: u64, _: &[TrialRecord], _: &Objective) -> bool {
        false
    }

    fn name(&self) -> &str {
        "never"
    }
}

// ---- Bandit ----

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slack {
    /// Relative slack scaled by the magnitude of the best value: maximize
    /// keeps `best - f * |best|`, minimize keeps `best + f * |best|`.
    Factor(f64),
    /// Absolute slack around the best value.
    Amount(f64),
}

/// Cancels a trial whose best value so far trails the best trial at the same
/// checkpoint by more than the slack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BanditPolicy {
    slack: Slack,
    gate: Gate,
}

impl BanditPolicy {
    pub fn new(slack: Slack, evaluation_interval: u64, delay_evaluation: u64) -> Self {
        Self {
            slack,
            gate: Gate::new(evaluation_interval, delay_evaluation),
        }
    }
}

impl EarlyTerminationPolicy for BanditPolicy {
    fn should_cancel(
        &self,
        trial: &TrialRecord,
        step: u64,
        all: &[TrialRecord],
        objective: &Objective,
    ) -> bool {
        let metric = objective.metric.as_str();
        let direction = objective.direction;
        if !self.gate.admits(step) {
            return false;
        }
        let Some(own) = trial.best_up_to(metric, step, direction) else {
            return false;
        };
        let Some(best) = peers_at(all, metric, step)
            .filter_map(|peer| peer.best_up_to(metric, step, direction))
            .reduce(|best, v| if direction.is_better(v, best) { v } else { best })
        else {
            return false;
        };

        let bound = match (self.slack, direction) {
            (Slack::Factor(f), hs_types::ObjectiveDirection::Maximize) => best - f * best.abs(),
            (Slack::Factor(f), hs_types::ObjectiveDirection::Minimize) => best + f * best.abs(),
            (Slack::Amount(a), hs_types::ObjectiveDirection::Maximize) => best - a,
            (Slack::Amount(a), hs_types::ObjectiveDirection::Minimize) => best + a,
        };
        direction.is_better(bound, own)
    }

    fn name(&self) -> &str {
        "bandit"
    }
}

// ---- Median stopping ----

/// Cancels a trial whose best value so far is worse than the median of the
/// other trials' running averages at the same checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MedianStoppingPolicy {
    gate: Gate,
}

impl MedianStoppingPolicy {
    pub fn new(evaluation_interval: u64, delay_evaluation: u64) -> Self {
        Self {
            gate: Gate::new(evaluation_interval, delay_evaluation),
        }
    }
}

fn median(mut values: Vec<f64>) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    Some(if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    })
}

impl EarlyTerminationPolicy for MedianStoppingPolicy {
    fn should_cancel(
        &self,
        trial: &TrialRecord,
        step: u64,
        all: &[TrialRecord],
        objective: &Objective,
    ) -> bool {
        let metric = objective.metric.as_str();
        if !self.gate.admits(step) {
            return false;
        }
        let Some(own) = trial.best_up_to(metric, step, objective.direction) else {
            return false;
        };
        let averages: Vec<f64> = peers_at(all, metric, step)
            .filter(|peer| peer.id != trial.id)
            .filter_map(|peer| peer.average_up_to(metric, step))
            .collect();

        match median(averages) {
            Some(median) => objective.direction.is_better(median, own),
            None => false,
        }
    }

    fn name(&self) -> &str {
        "median_stopping"
    }
}

// ---- Truncation selection ----

/// Cancels a trial that ranks in the worst `truncation_percentage` percent of
/// the trials at the same checkpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TruncationSelectionPolicy {
    truncation_percentage: u32,
    gate: Gate,
}

impl TruncationSelectionPolicy {
    pub fn new(truncation_percentage: u32, evaluation_interval: u64, delay_evaluation: u64) -> Self {
        Self {
            truncation_percentage,
            gate: Gate::new(evaluation_interval, delay_evaluation),
        }
    }
}

impl EarlyTerminationPolicy for TruncationSelectionPolicy {
    fn should_cancel(
        &self,
        trial: &TrialRecord,
        step: u64,
        all: &[TrialRecord],
        objective: &Objective,
    ) -> bool {
        let metric = objective.metric.as_str();
        let direction = objective.direction;
        if !self.gate.admits(step) {
            return false;
        }

        let mut ranked: Vec<(f64, u64)> = peers_at(all, metric, step)
            .filter_map(|peer| peer.best_up_to(metric, step, direction).map(|v| (v, peer.id)))
            .collect();
        if ranked.len() < 2 {
            return false;
        }
        ranked.sort_by(|(a, a_id), (b, b_id)| {
            let by_value = match direction {
                hs_types::ObjectiveDirection::Maximize => b.total_cmp(a),
                hs_types::ObjectiveDirection::Minimize => a.total_cmp(b),
            };
            by_value.then(a_id.cmp(b_id))
        });

        let cut = ranked.len() * self.truncation_percentage as usize / 100;
        if cut == 0 {
            return false;
        }
        ranked
            .iter()
            .position(|(_, id)| *id == trial.id)
            .is_some_and(|rank| rank >= ranked.len() - cut)
    }

    fn name(&self) -> &str {
        "truncation_selection"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hs_types::{MetricPoint, ObjectiveDirection, ParameterSet, ParameterValue};

    fn objective(direction: ObjectiveDirection) -> Objective {
        Objective {
            metric: "AUC".to_string(),
            direction,
        }
    }

    fn trial(id: u64, status: TrialStatus, values: &[f64]) -> TrialRecord {
        let mut record = TrialRecord::new(
            id,
            ParameterSet::from_pairs(vec![("x", ParameterValue::Int(id as i64))]),
        );
        record.status = status;
        for (i, value) in values.iter().enumerate() {
            record.push_point(MetricPoint {
                name: "AUC".to_string(),
                step: i as u64 + 1,
                value: *value,
                logged_at: Utc::now(),
            });
        }
        record
    }

    /// Judge `trial` at its latest report.
    fn judge(
        policy: &dyn EarlyTerminationPolicy,
        trial: &TrialRecord,
        all: &[TrialRecord],
        objective: &Objective,
    ) -> bool {
        policy.should_cancel(trial, trial.latest_step(&objective.metric), all, objective)
    }

    #[test]
    fn bandit_cancels_trial_outside_slack() {
        let policy = BanditPolicy::new(Slack::Factor(0.1), 1, 0);
        let leader = trial(0, TrialStatus::Running, &[0.70, 0.90]);
        let laggard = trial(1, TrialStatus::Running, &[0.60, 0.75]);
        let close = trial(2, TrialStatus::Running, &[0.65, 0.85]);
        let all = vec![leader.clone(), laggard.clone(), close.clone()];
        let obj = objective(ObjectiveDirection::Maximize);

        // 0.90 - 0.1 * 0.90 = 0.81
        assert!(judge(&policy, &laggard, &all, &obj));
        assert!(!judge(&policy, &close, &all, &obj));
        assert!(!judge(&policy, &leader, &all, &obj));
    }

    #[test]
    fn bandit_factor_with_negative_values_maximize() {
        let policy = BanditPolicy::new(Slack::Factor(0.1), 1, 0);
        let leader = trial(0, TrialStatus::Running, &[-1.0]);
        let laggard = trial(1, TrialStatus::Running, &[-2.0]);
        let all = vec![leader.clone(), laggard.clone()];
        let obj = objective(ObjectiveDirection::Maximize);

        // -1.0 - 0.1 * 1.0 = -1.1
        assert!(!judge(&policy, &leader, &all, &obj));
        assert!(judge(&policy, &laggard, &all, &obj));

        let near = trial(2, TrialStatus::Running, &[-1.05]);
        let all = vec![leader, near.clone()];
        assert!(!judge(&policy, &near, &all, &obj));
    }

    #[test]
    fn bandit_factor_with_negative_values_minimize() {
        let policy = BanditPolicy::new(Slack::Factor(0.1), 1, 0);
        let leader = trial(0, TrialStatus::Running, &[-2.0]);
        let other = trial(1, TrialStatus::Running, &[-1.0]);
        let all = vec![leader.clone(), other.clone()];
        let obj = objective(ObjectiveDirection::Minimize);

        // -2.0 + 0.1 * 2.0 = -1.8
        assert!(!judge(&policy, &leader, &all, &obj));
        assert!(judge(&policy, &other, &all, &obj));
    }

    #[test]
    fn bandit_compares_at_the_same_checkpoint() {
        let policy = BanditPolicy::new(Slack::Amount(0.05), 1, 0);
        // The leader's later values must not be used against an early trial.
        let leader = trial(0, TrialStatus::Running, &[0.60, 0.95, 0.97]);
        let young = trial(1, TrialStatus::Running, &[0.58]);
        let all = vec![leader, young.clone()];
        assert!(!judge(&policy, &young, &all, &objective(ObjectiveDirection::Maximize)));
    }

    #[test]
    fn bandit_judges_the_reported_step_not_the_latest() {
        let policy = BanditPolicy::new(Slack::Factor(0.1), 2, 0);
        let leader = trial(0, TrialStatus::Running, &[0.9, 0.9, 0.9]);
        // Three points already stored when the reports are handled one by one.
        let laggard = trial(1, TrialStatus::Running, &[0.3, 0.3, 0.3]);
        let all = vec![leader, laggard.clone()];
        let obj = objective(ObjectiveDirection::Maximize);

        assert!(!policy.should_cancel(&laggard, 1, &all, &obj));
        assert!(policy.should_cancel(&laggard, 2, &all, &obj));
        assert!(!policy.should_cancel(&laggard, 3, &all, &obj));
    }

    #[test]
    fn later_points_do_not_leak_into_an_earlier_checkpoint() {
        let policy = BanditPolicy::new(Slack::Amount(0.05), 1, 0);
        let leader = trial(0, TrialStatus::Running, &[0.6, 0.6]);
        // Bad at step 1, recovered by step 2.
        let recovering = trial(1, TrialStatus::Running, &[0.5, 0.9]);
        let all = vec![leader, recovering.clone()];
        let obj = objective(ObjectiveDirection::Maximize);

        assert!(policy.should_cancel(&recovering, 1, &all, &obj));
        assert!(!policy.should_cancel(&recovering, 2, &all, &obj));
    }

    #[test]
    fn bandit_minimize_direction() {
        let policy = BanditPolicy::new(Slack::Amount(0.1), 1, 0);
        let best = trial(0, TrialStatus::Completed, &[0.30]);
        let bad = trial(1, TrialStatus::Running, &[0.45]);
        let ok = trial(2, TrialStatus::Running, &[0.38]);
        let all = vec![best, bad.clone(), ok.clone()];
        let obj = objective(ObjectiveDirection::Minimize);
        assert!(judge(&policy, &bad, &all, &obj));
        assert!(!judge(&policy, &ok, &all, &obj));
    }

    #[test]
    fn no_metric_is_never_cancelled() {
        let policy = BanditPolicy::new(Slack::Factor(0.0), 1, 0);
        let leader = trial(0, TrialStatus::Running, &[0.9]);
        let fresh = trial(1, TrialStatus::Running, &[]);
        let all = vec![leader, fresh.clone()];
        let obj = objective(ObjectiveDirection::Maximize);
        assert!(!judge(&policy, &fresh, &all, &obj));
        assert!(!policy.should_cancel(&fresh, 1, &all, &obj));
    }

    #[test]
    fn interval_and_delay_gate_evaluation() {
        let policy = BanditPolicy::new(Slack::Factor(0.0), 2, 2);
        let leader = trial(0, TrialStatus::Running, &[0.9, 0.9, 0.9, 0.9]);
        let lagging = trial(1, TrialStatus::Running, &[0.1, 0.1, 0.1, 0.1]);
        let all = vec![leader, lagging.clone()];
        let obj = objective(ObjectiveDirection::Maximize);

        // step 2: within delay
        assert!(!policy.should_cancel(&lagging, 2, &all, &obj));
        // step 3: not on the interval
        assert!(!policy.should_cancel(&lagging, 3, &all, &obj));
        // step 4: evaluated
        assert!(policy.should_cancel(&lagging, 4, &all, &obj));
    }

    #[test]
    fn failed_and_cancelled_trials_are_not_peers() {
        let policy = BanditPolicy::new(Slack::Factor(0.1), 1, 0);
        let failed = trial(0, TrialStatus::Failed, &[0.99]);
        let cancelled = trial(1, TrialStatus::Cancelled, &[0.99]);
        let current = trial(2, TrialStatus::Running, &[0.5]);
        let all = vec![failed, cancelled, current.clone()];
        assert!(!judge(&policy, &current, &all, &objective(ObjectiveDirection::Maximize)));
    }

    #[test]
    fn median_stopping() {
        let policy = MedianStoppingPolicy::new(1, 0);
        let a = trial(0, TrialStatus::Completed, &[0.80, 0.82]);
        let b = trial(1, TrialStatus::Running, &[0.70, 0.74]);
        let c = trial(2, TrialStatus::Running, &[0.60, 0.62]);
        let all = vec![a.clone(), b.clone(), c.clone()];
        let obj = objective(ObjectiveDirection::Maximize);

        // Others' averages for c: 0.81 and 0.72, median 0.765.
        assert!(judge(&policy, &c, &all, &obj));
        // Others' averages for b: 0.81 and 0.61, median 0.71; b's best is 0.74.
        assert!(!judge(&policy, &b, &all, &obj));

        let alone = vec![c.clone()];
        assert!(!judge(&policy, &c, &alone, &obj));
    }

    #[test]
    fn truncation_selection_cuts_bottom_fraction() {
        let policy = TruncationSelectionPolicy::new(25, 1, 0);
        let trials: Vec<TrialRecord> = [0.9, 0.8, 0.7, 0.6]
            .iter()
            .enumerate()
            .map(|(i, v)| trial(i as u64, TrialStatus::Running, &[*v]))
            .collect();
        let obj = objective(ObjectiveDirection::Maximize);

        assert!(judge(&policy, &trials[3], &trials, &obj));
        assert!(!judge(&policy, &trials[2], &trials, &obj));
        assert!(!judge(&policy, &trials[0], &trials, &obj));
    }

    #[test]
    fn build_policy_from_config() {
        let policy = build_policy(&PolicyConfig::bandit(0.2));
        assert_eq!(policy.name(), "bandit");
        let policy = build_policy(&PolicyConfig::MedianStopping {
            evaluation_interval: 1,
            delay_evaluation: 5,
        });
        assert_eq!(policy.name(), "median_stopping");
        assert_eq!(NeverCancel.name(), "never");
    }
}
