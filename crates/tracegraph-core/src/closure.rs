//! # Closure Check
//!
//! Proves ingestion is deterministic by running it twice and comparing
//! the resulting graphs.
//!
//! ```text
//! IDLE -> PRECHECK -> RUN_1 -> SNAPSHOT_1 -> RUN_2 -> SNAPSHOT_2 -> COMPARE -> PASS | FAIL
//! ```
//!
//! Any state may fall straight to FAIL, including a run in which the upsert
//! engine rejected any item. Evidence (a JSON report plus one DECISION
//! ledger entry) is written on every terminal transition.

use crate::cancel::CancellationToken;
use crate::ledger::LedgerEntry;
use crate::pipeline::{IngestionPipeline, RunSummary};
use crate::snapshot::{LeafSource, Snapshot};
use crate::types::{CoreError, EpochContext, TenantId};
use crate::upsert::UpsertEngine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClosureState {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "PRECHECK")]
    Precheck,
    #[serde(rename = "RUN_1")]
    Run1,
    #[serde(rename = "SNAPSHOT_1")]
    Snapshot1,
    #[serde(rename = "RUN_2")]
    Run2,
    #[serde(rename = "SNAPSHOT_2")]
    Snapshot2,
    #[serde(rename = "COMPARE")]
    Compare,
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

impl ClosureState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Pass | Self::Fail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: ClosureState,
    pub at: DateTime<Utc>,
}

/// One compared field: both observed values and whether they match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldCheck {
    pub first: String,
    pub second: String,
    pub equal: bool,
}

impl FieldCheck {
    fn of(first: impl ToString, second: impl ToString) -> Self {
        let (first, second) = (first.to_string(), second.to_string());
        Self {
            equal: first == second,
            first,
            second,
        }
    }
}

/// Field-by-field comparison of the two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitComparison {
    pub entity_root: FieldCheck,
    pub relationship_structural_root: FieldCheck,
    pub relationship_effective_root: FieldCheck,
    pub entity_count: FieldCheck,
    pub relationship_count: FieldCheck,
}

impl ExplicitComparison {
    #[must_use]
    pub fn between(first: &Snapshot, second: &Snapshot) -> Self {
        Self {
            entity_root: FieldCheck::of(&first.entity_root, &second.entity_root),
            relationship_structural_root: FieldCheck::of(
                &first.relationship_structural_root,
                &second.relationship_structural_root,
            ),
            relationship_effective_root: FieldCheck::of(
                &first.relationship_effective_root,
                &second.relationship_effective_root,
            ),
            entity_count: FieldCheck::of(
                first.entity_digests.len(),
                second.entity_digests.len(),
            ),
            relationship_count: FieldCheck::of(
                first.relationship_digests.len(),
                second.relationship_digests.len(),
            ),
        }
    }

    #[must_use]
    pub fn all_equal(&self) -> bool {
        [
            &self.entity_root,
            &self.relationship_structural_root,
            &self.relationship_effective_root,
            &self.entity_count,
            &self.relationship_count,
        ]
        .iter()
        .all(|c| c.equal)
    }
}

/// Full record of one closure check, also written as evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosureReport {
    pub check_id: String,
    pub tenant_id: TenantId,
    pub verdict: ClosureState,
    pub attested_revision: Option<String>,
    pub recorded_revision: Option<String>,
    pub revision_after: Option<String>,
    pub runs: Vec<RunSummary>,
    pub snapshot_ids: Vec<String>,
    pub comparison: Option<ExplicitComparison>,
    pub failure: Option<String>,
    pub trail: Vec<StateTransition>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ClosureReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.verdict == ClosureState::Pass
    }

    fn enter(&mut self, state: ClosureState) {
        info!(check = %self.check_id, state = ?state, "closure state");
        self.verdict = state;
        self.trail.push(StateTransition {
            state,
            at: Utc::now(),
        });
    }

    fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(check = %self.check_id, reason = %reason, "closure check failed");
        self.failure = Some(reason);
        self.enter(ClosureState::Fail);
    }
}

/// Runs closure checks and writes their evidence.
#[derive(Debug, Clone)]
pub struct ClosureChecker {
    evidence_root: PathBuf,
    upsert: UpsertEngine,
}

impl ClosureChecker {
    /// Decisions are recorded through `upsert` so they share the ledger
    /// outbox with every other entry.
    #[must_use]
    pub fn new(evidence_root: impl Into<PathBuf>, upsert: UpsertEngine) -> Self {
        Self {
            evidence_root: evidence_root.into(),
            upsert,
        }
    }

    /// Evidence file path for a check.
    #[must_use]
    pub fn evidence_path(&self, tenant: &TenantId, check_id: &str) -> PathBuf {
        self.evidence_root
            .join(tenant.as_str())
            .join(format!("closure-{}.json", check_id))
    }

    /// Drive the state machine to a verdict.
    ///
    /// Returns `Err` only when evidence cannot be written; a failed check
    /// is an `Ok` report with verdict `FAIL`.
    pub fn run(
        &self,
        pipeline: &dyn IngestionPipeline,
        source: &dyn LeafSource,
        cancel: &CancellationToken,
    ) -> Result<ClosureReport, CoreError> {
        let mut report = ClosureReport {
            check_id: uuid::Uuid::new_v4().simple().to_string(),
            tenant_id: pipeline.tenant().clone(),
            verdict: ClosureState::Idle,
            attested_revision: None,
            recorded_revision: None,
            revision_after: None,
            runs: Vec::new(),
            snapshot_ids: Vec::new(),
            comparison: None,
            failure: None,
            trail: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        };
        report.enter(ClosureState::Idle);

        if let Err(e) = self.drive(&mut report, pipeline, source, cancel) {
            report.fail(e.to_string());
        }
        report.finished_at = Some(Utc::now());
        self.write_evidence(&report)?;
        Ok(report)
    }

    fn drive(
        &self,
        report: &mut ClosureReport,
        pipeline: &dyn IngestionPipeline,
        source: &dyn LeafSource,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let tenant = pipeline.tenant().clone();

        report.enter(ClosureState::Precheck);
        let attested = pipeline.current_revision()?;
        let recorded = pipeline.recorded_revision()?;
        report.attested_revision = Some(attested.clone());
        report.recorded_revision = Some(recorded.clone());
        if attested != recorded {
            report.fail(format!(
                "attested revision '{}' does not match recorded revision '{}'",
                attested, recorded
            ));
            return Ok(());
        }

        report.enter(ClosureState::Run1);
        cancel.check()?;
        if !Self::record_run(report, pipeline.run(&EpochContext::new(&recorded))?) {
            return Ok(());
        }

        report.enter(ClosureState::Snapshot1);
        let first = Snapshot::take(source, &tenant, cancel)?;
        report.snapshot_ids.push(first.snapshot_id.clone());

        report.enter(ClosureState::Run2);
        cancel.check()?;
        if !Self::record_run(report, pipeline.run(&EpochContext::new(&recorded))?) {
            return Ok(());
        }

        report.enter(ClosureState::Snapshot2);
        let second = Snapshot::take(source, &tenant, cancel)?;
        report.snapshot_ids.push(second.snapshot_id.clone());

        report.enter(ClosureState::Compare);
        let after = pipeline.recorded_revision()?;
        let revision_stable = after == recorded && pipeline.current_revision()? == attested;
        report.revision_after = Some(after);
        let comparison = ExplicitComparison::between(&first, &second);
        let identical = comparison.all_equal();
        report.comparison = Some(comparison);

        if !revision_stable {
            report.fail("source revision changed between runs");
        } else if !identical {
            report.fail("graph differs between runs");
        } else {
            report.enter(ClosureState::Pass);
        }
        Ok(())
    }

    /// Keep the run in the report; FAIL it when any item was rejected.
    fn record_run(report: &mut ClosureReport, run: RunSummary) -> bool {
        let rejected = run.rejected();
        let (entities, relationships) = (run.entities.failed, run.relationships.failed);
        report.runs.push(run);
        if rejected == 0 {
            return true;
        }
        report.fail(format!(
            "run {} rejected {} item(s): {} entities, {} relationships",
            report.runs.len(),
            rejected,
            entities,
            relationships
        ));
        false
    }

    fn write_evidence(&self, report: &ClosureReport) -> Result<(), CoreError> {
        let path = self.evidence_path(&report.tenant_id, &report.check_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        file.write_all(serde_json::to_string_pretty(report)?.as_bytes())?;
        file.sync_data()?;

        let verdict = if report.passed() { "PASS" } else { "FAIL" };
        let detail = match &report.failure {
            Some(reason) => format!("{}: {}", verdict, reason),
            None => verdict.to_string(),
        };
        let epoch = EpochContext::new(report.recorded_revision.clone().unwrap_or_default());
        let entry = LedgerEntry::decision(
            &report.tenant_id,
            format!("closure-{}", report.check_id),
            "CLOSURE",
            &epoch,
            detail,
        );
        self.upsert.record_decision(entry)?;
        info!(
            tenant = %report.tenant_id,
            check = %report.check_id,
            verdict,
            evidence = %path.display(),
            "closure evidence written"
        );
        Ok(())
    }
}
