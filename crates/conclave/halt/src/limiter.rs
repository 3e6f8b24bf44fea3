//! Sliding-window trigger limits.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use conclave_types::SourceId;
use dashmap::DashMap;

#[derive(Clone, Debug)]
pub struct LimiterConfig {
    pub window: Duration,
    /// Triggers one source may raise per window.
    pub per_source: u32,
    /// Triggers across all sources per window before the halt is escalated.
    pub aggregate: u32,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::minutes(1),
            per_source: 3,
            aggregate: 10,
        }
    }
}

/// What the limiter decided for one trigger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Admitted, and the aggregate limit was crossed by this trigger.
    Escalate {
        window_triggers: u32,
        sources: Vec<SourceId>,
    },
    SourceLimited,
}

#[derive(Default)]
struct Aggregate {
    hits: VecDeque<(DateTime<Utc>, SourceId)>,
    escalated: bool,
}

pub struct TriggerLimiter {
    config: LimiterConfig,
    per_source: DashMap<SourceId, VecDeque<DateTime<Utc>>>,
    aggregate: Mutex<Aggregate>,
}

fn prune<T>(queue: &mut VecDeque<T>, cutoff: DateTime<Utc>, at: impl Fn(&T) -> DateTime<Utc>) {
    while queue.front().is_some_and(|t| at(t) < cutoff) {
        queue.pop_front();
    }
}

impl TriggerLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config,
            per_source: DashMap::new(),
            aggregate: Mutex::new(Aggregate::default()),
        }
    }

    pub fn admit(&self, source: &SourceId, now: DateTime<Utc>) -> Admission {
        let cutoff = now - self.config.window;
        {
            let mut hits = self.per_source.entry(source.clone()).or_default();
            prune(&mut hits, cutoff, |t| *t);
            if hits.len() >= self.config.per_source as usize {
                return Admission::SourceLimited;
            }
            hits.push_back(now);
        }

        let mut aggregate = self.aggregate.lock().unwrap_or_else(|e| e.into_inner());
        prune(&mut aggregate.hits, cutoff, |(t, _)| *t);
        if aggregate.hits.is_empty() {
            aggregate.escalated = false;
        }
        aggregate.hits.push_back((now, source.clone()));

        let count = aggregate.hits.len();
        if count > self.config.aggregate as usize && !aggregate.escalated {
            aggregate.escalated = true;
            let sources: BTreeSet<SourceId> = aggregate.hits.iter().map(|(_, s)| s.clone()).collect();
            return Admission::Escalate {
                window_triggers: count as u32,
                sources: sources.into_iter().collect(),
            };
        }
        Admission::Admitted
    }

    /// Forget all history, e.g. after a clear.
    pub fn reset(&self) {
        self.per_source.clear();
        *self.aggregate.lock().unwrap_or_else(|e| e.into_inner()) = Aggregate::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_source_limit_suppresses_excess() {
        let limiter = TriggerLimiter::new(LimiterConfig {
            window: Duration::minutes(1),
            per_source: 2,
            aggregate: 100,
        });
        let now = Utc::now();
        let noisy = SourceId::new("noisy");
        assert_eq!(limiter.admit(&noisy, now), Admission::Admitted);
        assert_eq!(limiter.admit(&noisy, now), Admission::Admitted);
        assert_eq!(limiter.admit(&noisy, now), Admission::SourceLimited);
        assert_eq!(limiter.admit(&SourceId::new("quiet"), now), Admission::Admitted);
        assert_eq!(
            limiter.admit(&noisy, now + Duration::minutes(2)),
            Admission::Admitted
        );
    }

    #[test]
    fn aggregate_limit_escalates_once_per_window() {
        let limiter = TriggerLimiter::new(LimiterConfig {
            window: Duration::minutes(1),
            per_source: 10,
            aggregate: 2,
        });
        let now = Utc::now();
        assert_eq!(limiter.admit(&SourceId::new("a"), now), Admission::Admitted);
        assert_eq!(limiter.admit(&SourceId::new("b"), now), Admission::Admitted);
        match limiter.admit(&SourceId::new("c"), now) {
            Admission::Escalate {
                window_triggers,
                sources,
            } => {
                assert_eq!(window_triggers, 3);
                assert_eq!(sources.len(), 3);
            }
            other => panic!("expected escalation, got {other:?}"),
        }
        assert_eq!(limiter.admit(&SourceId::new("d"), now), Admission::Admitted);
    }
}
