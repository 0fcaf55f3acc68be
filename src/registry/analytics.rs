use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{ExecutionId, MappingStatus, WorkType, WorkflowMapping, WorkflowResult};

#[derive(Debug, Clone, Default)]
pub struct AnalyticsFilter {
    pub work_type: Option<WorkType>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl AnalyticsFilter {
    fn matches(&self, mapping: &WorkflowMapping) -> bool {
        self.work_type.map_or(true, |t| mapping.work_type == t)
            && self.created_after.map_or(true, |t| mapping.created_at >= t)
            && self.created_before.map_or(true, |t| mapping.created_at < t)
    }
}

/// Aggregate view over mappings and their results
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAnalytics {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub cancelled: usize,
    /// completed / total, as a percentage
    pub success_rate: f64,
    pub results_recorded: usize,
    pub average_confidence: Option<f64>,
    pub average_duration_ms: Option<f64>,
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

impl WorkflowAnalytics {
    pub fn compute(
        filter: &AnalyticsFilter,
        mappings: &[WorkflowMapping],
        results: &[WorkflowResult],
    ) -> Self {
        let mut analytics = WorkflowAnalytics::default();
        let mut included: HashSet<&ExecutionId> = HashSet::new();

        for mapping in mappings.iter().filter(|m| filter.matches(m)) {
            included.insert(&mapping.execution_id);
            analytics.total += 1;
            match mapping.status {
                MappingStatus::Active => analytics.active += 1,
                MappingStatus::Completed => analytics.completed += 1,
                MappingStatus::Failed => analytics.failed += 1,
                MappingStatus::Paused => analytics.paused += 1,
                MappingStatus::Cancelled => analytics.cancelled += 1,
            }
        }

        if analytics.total > 0 {
            analytics.success_rate = analytics.completed as f64 / analytics.total as f64 * 100.0;
        }

        let relevant: Vec<&WorkflowResult> = results
            .iter()
            .filter(|r| included.contains(&r.execution_id))
            .collect();
        analytics.results_recorded = relevant.len();
        analytics.average_confidence = mean(relevant.iter().filter_map(|r| r.confidence));
        analytics.average_duration_ms =
            mean(relevant.iter().filter_map(|r| r.duration_ms.map(|d| d as f64)));
        analytics
    }
}
