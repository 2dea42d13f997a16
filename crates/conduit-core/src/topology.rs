//! Topology value types: declared expectations, live fingerprints, and
//! drift reports.
//!
//! The declared side comes from an external schema/compiler stage; the
//! live side is captured from a running bus. Both are point-in-time
//! snapshots that the drift detector diffs without mutating either.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared topology: the topics and consumer groups that should exist.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectedTopology {
    /// Expected topics.
    pub topics: Vec<ExpectedTopic>,
}

impl ExpectedTopology {
    /// Looks up an expected topic by name.
    pub fn topic(&self, name: &str) -> Option<&ExpectedTopic> {
        self.topics.iter().find(|t| t.name == name)
    }
}

/// One declared topic with its expected consumer groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedTopic {
    /// Topic name.
    pub name: String,
    /// Consumer groups that should be attached.
    pub consumer_groups: Vec<String>,
    /// Declared partition count, when the backend has partitions.
    #[serde(default)]
    pub partitions: Option<u32>,
}

impl ExpectedTopic {
    /// Creates an expected topic with the given consumer groups.
    pub fn new(name: impl Into<String>, consumer_groups: Vec<String>) -> Self {
        Self { name: name.into(), consumer_groups, partitions: None }
    }
}

/// Live topology captured from a running bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyFingerprint {
    /// When the snapshot was taken.
    pub captured_at: DateTime<Utc>,
    /// Topics discovered on the backend.
    pub topics: Vec<TopicFingerprint>,
}

impl TopologyFingerprint {
    /// Looks up a live topic by name.
    pub fn topic(&self, name: &str) -> Option<&TopicFingerprint> {
        self.topics.iter().find(|t| t.name == name)
    }
}

/// Live state of one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicFingerprint {
    /// Topic name.
    pub name: String,
    /// Number of events currently held (approximate on some backends).
    pub event_count: u64,
    /// Consumer groups attached to the topic.
    pub groups: Vec<GroupFingerprint>,
    /// Partition count, when the backend has partitions.
    #[serde(default)]
    pub partitions: Option<u32>,
}

/// Live state of one consumer group on a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupFingerprint {
    /// Consumer group name.
    pub group_id: String,
    /// Approximate number of events not yet consumed.
    pub lag: u64,
}

/// Classification of a single divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    /// Declared topic absent from the live broker.
    MissingTopic,
    /// Live topic not present in the declaration. Ad-hoc consumers may
    /// be legitimate, so this is informational.
    ExtraTopic,
    /// Declared consumer group absent from the live topic.
    MissingConsumer,
    /// Consumer lag beyond the configured threshold.
    ConsumerLag,
    /// Partition or shape mismatch between declaration and live state.
    ShapeMismatch,
}

/// Severity of a drift issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    /// Informational only.
    Info,
    /// Worth investigating; the pipeline still functions.
    Warning,
    /// Declared delivery paths are broken.
    Error,
}

/// A single divergence between declared and live topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftIssue {
    /// Divergence classification.
    pub drift_type: DriftType,
    /// Severity.
    pub severity: DriftSeverity,
    /// Topic the issue concerns.
    pub topic: String,
    /// Consumer group the issue concerns, when group-scoped.
    pub group_id: Option<String>,
    /// Human-readable detail.
    pub detail: String,
}

/// Ephemeral report generated by one drift comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
    /// All issues found, in detection order.
    pub issues: Vec<DriftIssue>,
}

impl DriftReport {
    /// Whether the declared and live topologies match exactly.
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// Whether any issue is severe enough to break declared delivery.
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == DriftSeverity::Error)
    }

    /// Issues of one classification.
    pub fn issues_of(&self, drift_type: DriftType) -> impl Iterator<Item = &DriftIssue> {
        self.issues.iter().filter(move |i| i.drift_type == drift_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_puts_error_highest() {
        assert!(DriftSeverity::Error > DriftSeverity::Warning);
        assert!(DriftSeverity::Warning > DriftSeverity::Info);
    }

    #[test]
    fn report_queries() {
        let report = DriftReport {
            generated_at: Utc::now(),
            issues: vec![DriftIssue {
                drift_type: DriftType::ExtraTopic,
                severity: DriftSeverity::Info,
                topic: "adhoc".into(),
                group_id: None,
                detail: "not declared".into(),
            }],
        };
        assert!(!report.is_clean());
        assert!(!report.has_errors());
        assert_eq!(report.issues_of(DriftType::ExtraTopic).count(), 1);
    }
}
