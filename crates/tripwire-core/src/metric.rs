use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Network health metrics the engine evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    LatencyMs,
    PacketLossPct,
    JitterMs,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Self::LatencyMs, Self::PacketLossPct, Self::JitterMs];
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LatencyMs => write!(f, "latency_ms"),
            Self::PacketLossPct => write!(f, "packet_loss_pct"),
            Self::JitterMs => write!(f, "jitter_ms"),
        }
    }
}

/// One already-computed probe result for a metric source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub packet_loss_pct: Option<f64>,
    #[serde(default)]
    pub jitter_ms: Option<f64>,
}

impl MetricSample {
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            latency_ms: None,
            packet_loss_pct: None,
            jitter_ms: None,
        }
    }

    pub fn with_latency(mut self, ms: f64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn with_packet_loss(mut self, pct: f64) -> Self {
        self.packet_loss_pct = Some(pct);
        self
    }

    pub fn with_jitter(mut self, ms: f64) -> Self {
        self.jitter_ms = Some(ms);
        self
    }

    /// Raw value for a metric, including invalid ones.
    pub fn raw(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::LatencyMs => self.latency_ms,
            Metric::PacketLossPct => self.packet_loss_pct,
            Metric::JitterMs => self.jitter_ms,
        }
    }

    /// Usable value for a metric: present, finite and non-negative.
    pub fn value(&self, metric: Metric) -> Option<f64> {
        self.raw(metric).filter(|v| v.is_finite() && *v >= 0.0)
    }

    /// True when no metric carries a usable value.
    pub fn is_empty(&self) -> bool {
        Metric::ALL.iter().all(|m| self.value(*m).is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_values_are_not_usable() {
        let s = MetricSample::at(Utc::now())
            .with_latency(f64::NAN)
            .with_packet_loss(-1.0)
            .with_jitter(f64::INFINITY);
        assert!(s.raw(Metric::LatencyMs).is_some());
        assert!(s.value(Metric::LatencyMs).is_none());
        assert!(s.value(Metric::PacketLossPct).is_none());
        assert!(s.value(Metric::JitterMs).is_none());
        assert!(s.is_empty());
    }

    #[test]
    fn sample_deserializes_with_missing_metrics() {
        let s: MetricSample = serde_json::from_str(
            r#"{"timestamp":"2026-01-01T00:00:00Z","latency_ms":12.5}"#,
        )
        .unwrap();
        assert_eq!(s.value(Metric::LatencyMs), Some(12.5));
        assert!(s.packet_loss_pct.is_none());
    }
}
