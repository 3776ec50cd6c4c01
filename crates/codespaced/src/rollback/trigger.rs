//! Sliding-window trigger evaluation
//!
//! Health: a service trips the trigger once it has `threshold` consecutive
//! unhealthy records whose timestamps fit in `window_seconds`. A healthy record
//! resets that service. After tripping every window is cleared, so records that
//! fed one execution never count towards the next.
//!
//! Metrics (error rate, response time): trips when the mean of the samples
//! inside the window exceeds `threshold`; the window is cleared after tripping.

use crate::health::HealthSnapshot;
use chrono::{DateTime, Utc};
use codespace_common::config::TriggerConfig;
use codespace_common::TriggerKind;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Default)]
pub struct TriggerEvaluator {
    health: HashMap<String, VecDeque<DateTime<Utc>>>,
    metrics: HashMap<TriggerKind, VecDeque<(DateTime<Utc>, f64)>>,
}

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one snapshot; returns the services that tripped the trigger
    pub fn observe_health(
        &mut self,
        config: &TriggerConfig,
        snapshot: &HealthSnapshot,
    ) -> Option<Vec<String>> {
        let window = config.window();
        let needed = config.threshold.ceil().max(1.0) as usize;
        let mut tripped = Vec::new();

        for (name, record) in snapshot {
            if record.healthy {
                self.health.remove(name);
                continue;
            }

            let failures = self.health.entry(name.clone()).or_default();
            failures.push_back(record.last_check);
            while let Some(oldest) = failures.front() {
                if record.last_check - *oldest > window {
                    failures.pop_front();
                } else {
                    break;
                }
            }

            if failures.len() >= needed {
                tripped.push(name.clone());
            }
        }

        if tripped.is_empty() {
            None
        } else {
            self.health.clear();
            Some(tripped)
        }
    }

    /// Feed one metric sample; returns the window mean when it tripped
    pub fn observe_metric(
        &mut self,
        kind: TriggerKind,
        config: &TriggerConfig,
        value: f64,
        at: DateTime<Utc>,
    ) -> Option<f64> {
        let window = config.window();
        let samples = self.metrics.entry(kind).or_default();
        samples.push_back((at, value));
        samples.retain(|(t, _)| at - *t <= window);

        let mean = samples.iter().map(|(_, v)| v).sum::<f64>() / samples.len() as f64;
        if mean > config.threshold {
            samples.clear();
            Some(mean)
        } else {
            None
        }
    }

    /// Consecutive unhealthy records currently held for `service`
    pub fn pending_failures(&self, service: &str) -> usize {
        self.health.get(service).map(VecDeque::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use codespace_common::HealthRecord;

    fn trigger(threshold: f64, window_seconds: u64) -> TriggerConfig {
        TriggerConfig {
            enabled: true,
            threshold,
            window_seconds,
        }
    }

    fn snapshot(service: &str, healthy: bool, at: DateTime<Utc>) -> HealthSnapshot {
        let record = if healthy {
            HealthRecord::healthy(service, at, "ok")
        } else {
            HealthRecord::unhealthy(service, at, "down")
        };
        HealthSnapshot::from([(service.to_string(), record)])
    }

    #[test]
    fn test_three_failures_in_window_trip_once() {
        let config = trigger(3.0, 60);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();

        assert!(evaluator.observe_health(&config, &snapshot("database", false, t0)).is_none());
        assert!(evaluator
            .observe_health(&config, &snapshot("database", false, t0 + Duration::seconds(20)))
            .is_none());
        let tripped = evaluator
            .observe_health(&config, &snapshot("database", false, t0 + Duration::seconds(40)))
            .unwrap();
        assert_eq!(tripped, vec!["database"]);
        assert_eq!(evaluator.pending_failures("database"), 0);

        assert!(evaluator
            .observe_health(&config, &snapshot("database", false, t0 + Duration::seconds(130)))
            .is_none());
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let config = trigger(3.0, 60);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();

        for offset in [0, 50, 100] {
            assert!(evaluator
                .observe_health(&config, &snapshot("redis", false, t0 + Duration::seconds(offset)))
                .is_none());
        }
        assert_eq!(evaluator.pending_failures("redis"), 2);
    }

    #[test]
    fn test_healthy_record_resets() {
        let config = trigger(2.0, 60);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();

        evaluator.observe_health(&config, &snapshot("api", false, t0));
        evaluator.observe_health(&config, &snapshot("api", true, t0 + Duration::seconds(10)));
        assert!(evaluator
            .observe_health(&config, &snapshot("api", false, t0 + Duration::seconds(20)))
            .is_none());
    }

    #[test]
    fn test_huge_window_still_trips() {
        let config = trigger(2.0, u64::MAX);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();

        assert!(evaluator.observe_health(&config, &snapshot("database", false, t0)).is_none());
        assert_eq!(evaluator.pending_failures("database"), 1);
        assert!(evaluator
            .observe_health(&config, &snapshot("database", false, t0 + Duration::days(3)))
            .is_some());

        let kind = TriggerKind::ResponseTimeThreshold;
        assert!(evaluator.observe_metric(kind, &config, 5.0, t0).is_some());
    }

    #[test]
    fn test_response_time_window_expires_old_samples() {
        let config = trigger(2000.0, 60);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();
        let kind = TriggerKind::ResponseTimeThreshold;

        // one slow request alone trips
        assert_eq!(evaluator.observe_metric(kind, &config, 2500.0, t0), Some(2500.0));

        assert!(evaluator.observe_metric(kind, &config, 3900.0, t0).is_some());
        assert!(evaluator
            .observe_metric(kind, &config, 100.0, t0 + Duration::seconds(5))
            .is_none());
        // 3900 was cleared by the trip above, so only fast samples remain
        assert!(evaluator
            .observe_metric(kind, &config, 1900.0, t0 + Duration::seconds(10))
            .is_none());
        // after the window slides past them, a single slow sample stands alone
        let mean = evaluator
            .observe_metric(kind, &config, 2100.0, t0 + Duration::seconds(120))
            .unwrap();
        assert_eq!(mean, 2100.0);
    }

    #[test]
    fn test_metric_kinds_have_separate_windows() {
        let config = trigger(5.0, 300);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();

        assert!(evaluator
            .observe_metric(TriggerKind::ErrorRateThreshold, &config, 4.0, t0)
            .is_none());
        assert!(evaluator
            .observe_metric(TriggerKind::ResponseTimeThreshold, &config, 4.5, t0)
            .is_none());
        assert!(evaluator
            .observe_metric(TriggerKind::ErrorRateThreshold, &config, 7.0, t0)
            .is_some());
    }

    #[test]
    fn test_metric_mean_over_window() {
        let config = trigger(5.0, 300);
        let mut evaluator = TriggerEvaluator::new();
        let t0 = Utc::now();
        let kind = TriggerKind::ErrorRateThreshold;

        assert!(evaluator.observe_metric(kind, &config, 4.0, t0).is_none());
        assert!(evaluator
            .observe_metric(kind, &config, 5.5, t0 + Duration::seconds(10))
            .is_none());
        let mean = evaluator
            .observe_metric(kind, &config, 7.5, t0 + Duration::seconds(20))
            .unwrap();
        assert!((mean - 17.0 / 3.0).abs() < 1e-9);

        // window cleared
        assert!(evaluator
            .observe_metric(kind, &config, 1.0, t0 + Duration::seconds(30))
            .is_none());
    }
}
