//! Topology drift detection.
//!
//! The extractor snapshots the live topology of a running bus; the
//! detector diffs that snapshot against a declared expectation and
//! reports divergence. Neither touches the broker beyond read-only
//! introspection.

use chrono::Utc;
use conduit_core::{
    error::Result,
    topology::{
        DriftIssue, DriftReport, DriftSeverity, DriftType, ExpectedTopology, GroupFingerprint,
        TopicFingerprint, TopologyFingerprint,
    },
};
use tracing::debug;

use crate::bus::EventBus;

/// Captures a point-in-time fingerprint of a live bus.
pub struct TopologyExtractor;

impl TopologyExtractor {
    /// Builds the current topology from the bus introspection surface.
    ///
    /// # Errors
    ///
    /// Propagates any backend error raised while listing topics or
    /// querying per-topic state.
    pub async fn extract(bus: &dyn EventBus) -> Result<TopologyFingerprint> {
        let mut topics = Vec::new();

        for name in bus.list_topics().await? {
            let info = bus.get_topic_info(&name).await?;
            let mut groups = Vec::with_capacity(info.consumer_groups.len());
            for group_id in &info.consumer_groups {
                let consumer = bus.get_consumer_info(group_id, &name).await?;
                groups.push(GroupFingerprint { group_id: group_id.clone(), lag: consumer.lag });
            }
            topics.push(TopicFingerprint {
                name,
                event_count: info.event_count,
                groups,
                partitions: info.partitions,
            });
        }

        Ok(TopologyFingerprint { captured_at: Utc::now(), topics })
    }
}

/// Tuning for the drift comparison.
#[derive(Debug, Clone)]
pub struct DriftConfig {
    /// Consumer lag at or beyond which a warning is raised.
    pub lag_threshold: u64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self { lag_threshold: 1_000 }
    }
}

/// Diffs a declared topology against a live fingerprint.
#[derive(Debug, Clone, Default)]
pub struct TopologyDriftDetector {
    config: DriftConfig,
}

impl TopologyDriftDetector {
    /// Creates a detector with the given tuning.
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    /// Structural diff between declared and live topology.
    ///
    /// Declared topics missing live are errors; live topics that were
    /// never declared are informational; declared groups missing from a
    /// live topic are errors; lag at or beyond the threshold warns;
    /// partition-count mismatches warn.
    pub fn compare(
        &self,
        expected: &ExpectedTopology,
        actual: &TopologyFingerprint,
    ) -> DriftReport {
        let mut issues = Vec::new();

        for declared in &expected.topics {
            let Some(live) = actual.topic(&declared.name) else {
                issues.push(DriftIssue {
                    drift_type: DriftType::MissingTopic,
                    severity: DriftSeverity::Error,
                    topic: declared.name.clone(),
                    group_id: None,
                    detail: "declared topic not present on the broker".to_string(),
                });
                continue;
            };

            if let (Some(want), Some(have)) = (declared.partitions, live.partitions) {
                if want != have {
                    issues.push(DriftIssue {
                        drift_type: DriftType::ShapeMismatch,
                        severity: DriftSeverity::Warning,
                        topic: declared.name.clone(),
                        group_id: None,
                        detail: format!("declared {want} partitions, broker has {have}"),
                    });
                }
            }

            for group_id in &declared.consumer_groups {
                let Some(live_group) = live.groups.iter().find(|g| &g.group_id == group_id)
                else {
                    issues.push(DriftIssue {
                        drift_type: DriftType::MissingConsumer,
                        severity: DriftSeverity::Error,
                        topic: declared.name.clone(),
                        group_id: Some(group_id.clone()),
                        detail: "declared consumer group not attached".to_string(),
                    });
                    continue;
                };

                if live_group.lag >= self.config.lag_threshold {
                    issues.push(DriftIssue {
                        drift_type: DriftType::ConsumerLag,
                        severity: DriftSeverity::Warning,
                        topic: declared.name.clone(),
                        group_id: Some(group_id.clone()),
                        detail: format!(
                            "lag {} at or beyond threshold {}",
                            live_group.lag, self.config.lag_threshold
                        ),
                    });
                }
            }
        }

        for live in &actual.topics {
            if expected.topic(&live.name).is_none() {
                issues.push(DriftIssue {
                    drift_type: DriftType::ExtraTopic,
                    severity: DriftSeverity::Info,
                    topic: live.name.clone(),
                    group_id: None,
                    detail: "live topic not present in the declaration".to_string(),
                });
            }
        }

        debug!(issues = issues.len(), "drift comparison complete");
        DriftReport { generated_at: Utc::now(), issues }
    }
}

#[cfg(test)]
mod tests {
    use conduit_core::topology::ExpectedTopic;

    use super::*;

    fn live_topic(name: &str, groups: Vec<GroupFingerprint>) -> TopicFingerprint {
        TopicFingerprint { name: name.to_string(), event_count: 0, groups, partitions: None }
    }

    fn fingerprint(topics: Vec<TopicFingerprint>) -> TopologyFingerprint {
        TopologyFingerprint { captured_at: Utc::now(), topics }
    }

    #[test]
    fn matching_topologies_are_clean() {
        let expected = ExpectedTopology {
            topics: vec![ExpectedTopic::new("orders", vec!["billing".to_string()])],
        };
        let actual = fingerprint(vec![live_topic(
            "orders",
            vec![GroupFingerprint { group_id: "billing".to_string(), lag: 0 }],
        )]);

        let report = TopologyDriftDetector::default().compare(&expected, &actual);
        assert!(report.is_clean());
    }

    #[test]
    fn missing_declared_topic_is_an_error() {
        let expected =
            ExpectedTopology { topics: vec![ExpectedTopic::new("orders", Vec::new())] };
        let actual = fingerprint(Vec::new());

        let report = TopologyDriftDetector::default().compare(&expected, &actual);
        assert!(report.has_errors());
        assert_eq!(report.issues_of(DriftType::MissingTopic).count(), 1);
    }

    #[test]
    fn missing_consumer_group_is_an_error() {
        let expected = ExpectedTopology {
            topics: vec![ExpectedTopic::new("orders", vec!["billing".to_string()])],
        };
        let actual = fingerprint(vec![live_topic("orders", Vec::new())]);

        let report = TopologyDriftDetector::default().compare(&expected, &actual);
        let issues: Vec<_> = report.issues_of(DriftType::MissingConsumer).collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].topic, "orders");
        assert_eq!(issues[0].group_id.as_deref(), Some("billing"));
        assert!(issues[0].severity >= DriftSeverity::Warning);
    }

    #[test]
    fn undeclared_live_topic_is_informational() {
        let expected = ExpectedTopology::default();
        let actual = fingerprint(vec![live_topic("adhoc", Vec::new())]);

        let report = TopologyDriftDetector::default().compare(&expected, &actual);
        assert!(!report.has_errors());
        assert_eq!(report.issues_of(DriftType::ExtraTopic).count(), 1);
    }

    #[test]
    fn lag_beyond_threshold_warns() {
        let expected = ExpectedTopology {
            topics: vec![ExpectedTopic::new("orders", vec!["billing".to_string()])],
        };
        let actual = fingerprint(vec![live_topic(
            "orders",
            vec![GroupFingerprint { group_id: "billing".to_string(), lag: 50 }],
        )]);

        let detector = TopologyDriftDetector::new(DriftConfig { lag_threshold: 10 });
        let report = detector.compare(&expected, &actual);
        let issues: Vec<_> = report.issues_of(DriftType::ConsumerLag).collect();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, DriftSeverity::Warning);
    }

    #[test]
    fn partition_mismatch_is_a_shape_issue() {
        let mut declared = ExpectedTopic::new("orders", Vec::new());
        declared.partitions = Some(12);
        let expected = ExpectedTopology { topics: vec![declared] };
        let actual = fingerprint(vec![TopicFingerprint {
            name: "orders".to_string(),
            event_count: 0,
            groups: Vec::new(),
            partitions: Some(3),
        }]);

        let report = TopologyDriftDetector::default().compare(&expected, &actual);
        assert_eq!(report.issues_of(DriftType::ShapeMismatch).count(), 1);
    }
}
