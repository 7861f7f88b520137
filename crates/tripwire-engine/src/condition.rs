//! Condition evaluation over metric sample windows.
//!
//! A condition trigger fires when either rule breaches for any metric:
//! - instantaneous: the latest valid value exceeds its threshold;
//! - sustained: at least N valid values within the last W seconds (measured
//!   back from the newest sample) exceed the threshold.
//!
//! Thresholds are exclusive. Missing, NaN, infinite and negative values are
//! excluded from both rules.

use std::collections::VecDeque;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tripwire_core::metric::{Metric, MetricSample};

/// Threshold set for a condition trigger. Read-only to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdPolicy {
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub packet_loss_pct: Option<f64>,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
    /// Sustained-breach rule.
    #[serde(default)]
    pub consecutive: Option<ConsecutiveRule>,
}

/// `count` breaching samples within `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsecutiveRule {
    pub count: u32,
    pub window_secs: u64,
}

impl ThresholdPolicy {
    pub fn threshold(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::LatencyMs => self.latency_ms,
            Metric::PacketLossPct => self.packet_loss_pct,
            Metric::JitterMs => self.jitter_ms,
        }
    }

    /// Problems that make the policy unusable.
    pub fn check(&self) -> Vec<String> {
        let mut problems = Vec::new();
        let mut any = false;
        for metric in Metric::ALL {
            if let Some(t) = self.threshold(metric) {
                any = true;
                if !t.is_finite() || t < 0.0 {
                    problems.push(format!("{} threshold must be a non-negative number", metric));
                }
            }
        }
        if !any {
            problems.push("no metric threshold configured".to_string());
        }
        if let Some(rule) = &self.consecutive {
            if rule.count == 0 {
                problems.push("consecutive.count must be at least 1".to_string());
            }
        }
        problems
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachRule {
    Instantaneous,
    Sustained,
}

/// One metric that breached under one rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub metric: Metric,
    pub rule: BreachRule,
    /// Offending value (largest breaching value for sustained breaches).
    pub observed: f64,
    pub threshold: f64,
    /// Breaching samples counted, for sustained breaches.
    #[serde(default)]
    pub count: Option<u32>,
}

impl Breach {
    /// `(observed - threshold) / threshold`; a zero threshold counts as 1.0.
    pub fn relative_excess(&self) -> f64 {
        if self.threshold <= 0.0 {
            1.0
        } else {
            ((self.observed - self.threshold) / self.threshold).max(0.0)
        }
    }
}

/// Result of evaluating a policy against a window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub fired: bool,
    pub breaches: Vec<Breach>,
    /// Breach with the largest relative excess.
    pub worst: Option<Breach>,
}

/// Bounded, timestamp-ordered buffer of samples for one source.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<MetricSample>,
    retention: Duration,
    max_samples: usize,
}

impl SampleWindow {
    pub fn new(retention_secs: u64, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            retention: Duration::seconds(retention_secs.min(i64::MAX as u64) as i64),
            max_samples: max_samples.max(1),
        }
    }

    /// Insert in timestamp order, then drop samples past retention or capacity.
    pub fn push(&mut self, sample: MetricSample) {
        let pos = self
            .samples
            .iter()
            .rposition(|s| s.timestamp <= sample.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.samples.insert(pos, sample);

        if let Some(newest) = self.samples.back().map(|s| s.timestamp) {
            let cutoff = newest - self.retention;
            while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
                self.samples.pop_front();
            }
        }
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MetricSample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.samples.back()
    }
}

/// Evaluate a threshold policy against a sample window.
pub fn evaluate(policy: &ThresholdPolicy, window: &SampleWindow) -> TriggerDecision {
    let mut breaches = Vec::new();
    let Some(newest) = window.latest().map(|s| s.timestamp) else {
        return TriggerDecision::default();
    };

    for metric in Metric::ALL {
        let Some(threshold) = policy.threshold(metric) else {
            continue;
        };

        // Instantaneous: latest valid value for this metric.
        let latest = window.iter().rev().find_map(|s| {
            let v = s.value(metric);
            if v.is_none() {
                log_exclusion(s, metric);
            }
            v
        });
        if let Some(observed) = latest {
            if observed > threshold {
                breaches.push(Breach {
                    metric,
                    rule: BreachRule::Instantaneous,
                    observed,
                    threshold,
                    count: None,
                });
            }
        }

        // Sustained: N breaching values within W of the newest sample.
        if let Some(rule) = policy.consecutive {
            let since = newest - Duration::seconds(rule.window_secs.min(i64::MAX as u64) as i64);
            let over: Vec<f64> = window
                .iter()
                .filter(|s| s.timestamp >= since)
                .filter_map(|s| s.value(metric))
                .filter(|v| *v > threshold)
                .collect();
            let count = over.len() as u32;
            if rule.count > 0 && count >= rule.count {
                let observed = over.iter().copied().fold(f64::MIN, f64::max);
                breaches.push(Breach {
                    metric,
                    rule: BreachRule::Sustained,
                    observed,
                    threshold,
                    count: Some(count),
                });
            }
        }
    }

    let worst = breaches
        .iter()
        .max_by(|a, b| a.relative_excess().total_cmp(&b.relative_excess()))
        .cloned();

    TriggerDecision {
        fired: !breaches.is_empty(),
        breaches,
        worst,
    }
}

fn log_exclusion(sample: &MetricSample, metric: Metric) {
    match sample.raw(metric) {
        None => debug!(metric = %metric, at = %sample.timestamp, "Sample missing metric, excluded"),
        Some(v) => debug!(metric = %metric, value = v, at = %sample.timestamp, "Invalid sample value, excluded"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn t(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn latency_policy(threshold: f64) -> ThresholdPolicy {
        ThresholdPolicy {
            latency_ms: Some(threshold),
            ..Default::default()
        }
    }

    fn window(samples: Vec<MetricSample>) -> SampleWindow {
        let mut w = SampleWindow::new(3600, 100);
        for s in samples {
            w.push(s);
        }
        w
    }

    #[test]
    fn empty_window_never_fires() {
        let d = evaluate(&latency_policy(100.0), &SampleWindow::new(60, 10));
        assert!(!d.fired);
        assert!(d.worst.is_none());
    }

    #[test]
    fn threshold_is_exclusive() {
        let w = window(vec![MetricSample::at(t(0)).with_latency(100.0)]);
        assert!(!evaluate(&latency_policy(100.0), &w).fired);

        let w = window(vec![MetricSample::at(t(0)).with_latency(100.01)]);
        assert!(evaluate(&latency_policy(100.0), &w).fired);
    }

    #[test]
    fn instantaneous_uses_latest_valid_value() {
        let w = window(vec![
            MetricSample::at(t(0)).with_latency(150.0),
            MetricSample::at(t(1)).with_latency(f64::NAN),
        ]);
        let d = evaluate(&latency_policy(100.0), &w);
        assert!(d.fired);
        assert_eq!(d.breaches[0].observed, 150.0);

        let w = window(vec![
            MetricSample::at(t(0)).with_latency(150.0),
            MetricSample::at(t(1)).with_latency(50.0),
        ]);
        assert!(!evaluate(&latency_policy(100.0), &w).fired);
    }

    #[test]
    fn invalid_values_never_breach() {
        let w = window(vec![
            MetricSample::at(t(0)).with_latency(f64::NAN),
            MetricSample::at(t(1)).with_latency(f64::INFINITY),
            MetricSample::at(t(2)).with_latency(-5.0),
            MetricSample::at(t(3)),
        ]);
        let policy = ThresholdPolicy {
            latency_ms: Some(0.0),
            consecutive: Some(ConsecutiveRule { count: 1, window_secs: 60 }),
            ..Default::default()
        };
        assert!(!evaluate(&policy, &w).fired);
    }

    #[test]
    fn sustained_counts_within_window_inclusive() {
        // Latest sample is fine, so only the sustained rule can fire.
        let samples = vec![
            MetricSample::at(t(0)).with_packet_loss(5.0),
            MetricSample::at(t(30)).with_packet_loss(6.0),
            MetricSample::at(t(60)).with_packet_loss(7.0),
            MetricSample::at(t(61)).with_packet_loss(0.5),
        ];
        let policy = ThresholdPolicy {
            packet_loss_pct: Some(2.0),
            consecutive: Some(ConsecutiveRule { count: 3, window_secs: 61 }),
            ..Default::default()
        };
        let d = evaluate(&policy, &window(samples.clone()));
        assert!(d.fired);
        assert_eq!(d.breaches.len(), 1);
        assert_eq!(d.breaches[0].rule, BreachRule::Sustained);
        assert_eq!(d.breaches[0].count, Some(3));
        assert_eq!(d.breaches[0].observed, 7.0);

        // A window one second shorter drops the first sample.
        let narrower = ThresholdPolicy {
            consecutive: Some(ConsecutiveRule { count: 3, window_secs: 60 }),
            ..policy
        };
        assert!(!evaluate(&narrower, &window(samples)).fired);
    }

    #[test]
    fn worst_breach_has_largest_relative_excess() {
        let w = window(vec![MetricSample::at(t(0))
            .with_latency(150.0)
            .with_jitter(40.0)]);
        let policy = ThresholdPolicy {
            latency_ms: Some(100.0),
            jitter_ms: Some(10.0),
            ..Default::default()
        };
        let d = evaluate(&policy, &w);
        assert_eq!(d.breaches.len(), 2);
        let worst = d.worst.unwrap();
        assert_eq!(worst.metric, Metric::JitterMs);
        assert_eq!(worst.relative_excess(), 3.0);
    }

    #[test]
    fn zero_threshold_excess_is_one() {
        let b = Breach {
            metric: Metric::PacketLossPct,
            rule: BreachRule::Instantaneous,
            observed: 0.1,
            threshold: 0.0,
            count: None,
        };
        assert_eq!(b.relative_excess(), 1.0);
    }

    #[test]
    fn window_orders_and_bounds_samples() {
        let mut w = SampleWindow::new(10, 3);
        w.push(MetricSample::at(t(5)).with_latency(1.0));
        w.push(MetricSample::at(t(1)).with_latency(2.0));
        w.push(MetricSample::at(t(3)).with_latency(3.0));
        let order: Vec<_> = w.iter().map(|s| s.timestamp).collect();
        assert_eq!(order, vec![t(1), t(3), t(5)]);

        w.push(MetricSample::at(t(6)).with_latency(4.0));
        assert_eq!(w.len(), 3);
        assert_eq!(w.iter().next().unwrap().timestamp, t(3));

        // Retention is measured from the newest sample.
        w.push(MetricSample::at(t(20)).with_latency(5.0));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn policy_check() {
        assert!(latency_policy(100.0).check().is_empty());
        assert_eq!(ThresholdPolicy::default().check().len(), 1);
        let bad = ThresholdPolicy {
            latency_ms: Some(-1.0),
            consecutive: Some(ConsecutiveRule { count: 0, window_secs: 10 }),
            ..Default::default()
        };
        assert_eq!(bad.check().len(), 2);
    }
}
