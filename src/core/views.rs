//! Serializable views returned by status queries and the CLI's `--json` output

use crate::core::compiler::Compilation;
use crate::core::engine::{ApplySummary, EngineStatus};
use crate::core::lifecycle::{EntityStatus, LifecycleState};
use crate::core::model::EntityRef;
use crate::core::scheduler::{JobRecord, JobState};
use crate::core::sync::SyncReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub enabled: bool,
    pub active_directive_count: usize,
    pub last_apply_result: Option<ApplySummary>,
    pub drift_count: usize,
    pub fingerprint: Option<String>,
    /// Entities with a failed directive or compile error
    pub degraded: Vec<EntityView>,
}

impl From<&EngineStatus> for StatusView {
    fn from(status: &EngineStatus) -> Self {
        Self {
            enabled: status.enabled,
            active_directive_count: status.active_directive_count,
            last_apply_result: status.last_apply.clone(),
            drift_count: status.drift_count,
            fingerprint: status.fingerprint.clone(),
            degraded: status
                .entities
                .iter()
                .filter(|(_, s)| s.degraded)
                .map(|(e, s)| EntityView::new(*e, s))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityView {
    pub entity: EntityRef,
    pub state: LifecycleState,
    pub degraded: bool,
    pub active_directives: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl EntityView {
    pub fn new(entity: EntityRef, status: &EntityStatus) -> Self {
        Self {
            entity,
            state: status.state,
            degraded: status.degraded,
            active_directives: status.active_directives,
            last_error: status.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: Uuid,
    pub job: String,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&JobRecord> for JobView {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            job: record.job.to_string(),
            state: record.state,
            enqueued_at: record.enqueued_at,
            finished_at: record.finished_at,
            error: record.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReportView {
    pub drift_count: usize,
    pub corrected: usize,
    pub imported: usize,
    pub orphaned: usize,
    pub orphans: Vec<String>,
    pub errors: Vec<String>,
}

impl From<&SyncReport> for SyncReportView {
    fn from(report: &SyncReport) -> Self {
        Self {
            drift_count: report.drift_count,
            corrected: report.corrected,
            imported: report.imported,
            orphaned: report.orphaned,
            orphans: report.orphans.clone(),
            errors: report.errors.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectiveView {
    pub owner: EntityRef,
    pub directive: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityErrorView {
    pub entity: EntityRef,
    pub error: String,
}

/// `compile --json` output
#[derive(Debug, Clone, Serialize)]
pub struct CompilationView {
    pub fingerprint: String,
    pub directives: Vec<DirectiveView>,
    pub errors: Vec<EntityErrorView>,
    pub warnings: Vec<String>,
}

impl CompilationView {
    pub fn new(table: &str, compilation: &Compilation) -> Self {
        Self {
            fingerprint: crate::core::directive::fingerprint(table, &compilation.directives),
            directives: compilation
                .directives
                .iter()
                .map(|d| {
                    let invocation = d.invocation(table);
                    let mut argv = vec![invocation.program.to_string()];
                    argv.extend(invocation.args);
                    DirectiveView {
                        owner: d.owner,
                        directive: d.to_string(),
                        argv,
                    }
                })
                .collect(),
            errors: compilation
                .errors
                .iter()
                .map(|e| EntityErrorView {
                    entity: e.entity,
                    error: e.error.to_string(),
                })
                .collect(),
            warnings: compilation.warnings.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::compiler::{PriorityOrder, compile};
    use crate::core::model::PolicySnapshot;
    use crate::core::test_helpers::{rule, zone};

    #[test]
    fn test_status_view_uses_camel_case() {
        let status = EngineStatus {
            enabled: true,
            active_directive_count: 3,
            last_apply: Some(ApplySummary {
                succeeded: 3,
                failed: 0,
                errors: vec![],
            }),
            drift_count: 1,
            fingerprint: Some("ab".into()),
            entities: vec![(
                EntityRef::Rule(1),
                EntityStatus {
                    degraded: true,
                    last_error: Some("boom".into()),
                    ..EntityStatus::default()
                },
            )],
        };
        let json = serde_json::to_value(StatusView::from(&status)).unwrap();
        assert_eq!(json["activeDirectiveCount"], 3);
        assert_eq!(json["lastApplyResult"]["succeeded"], 3);
        assert_eq!(json["driftCount"], 1);
        assert_eq!(json["degraded"][0]["entity"], "rule:1");
        assert_eq!(json["degraded"][0]["lastError"], "boom");
    }

    #[test]
    fn test_compilation_view_lists_argv() {
        let mut s = PolicySnapshot::default();
        s.zones.push(zone(1, "wan", 0, &["eth0"]));
        s.rules.push(rule(2, "wan", 0, "tcp", "22"));
        s.rules.push(rule(3, "nowhere", 0, "tcp", "80"));
        let view = CompilationView::new("zonefw", &compile(&s, PriorityOrder::Ascending));
        assert_eq!(view.directives[0].argv[0], "nft");
        assert_eq!(view.directives[0].owner, EntityRef::Rule(2));
        assert_eq!(view.errors.len(), 1);
        assert_eq!(view.errors[0].entity, EntityRef::Rule(3));
    }
}
