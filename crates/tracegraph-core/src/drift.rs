//! # Drift Detection
//!
//! Record-level diff between two snapshots, an allowlist gate, and
//! best-effort signal emission for unexpected drift.
//!
//! Entities are compared by content hash, relationships by effective hash
//! (so a confidence change is drift). The gate fails when any change is
//! not covered by an allowlist rule. Signal emission never blocks the
//! gate: a failing sink is logged and the verdict stands.

use crate::primitives::DRIFT_SIGNAL_FILE_NAME;
use crate::snapshot::Snapshot;
use crate::types::{CoreError, TenantId};
use chrono::{DateTime, Utc};
use glob::Pattern;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{info, warn};

// =============================================================================
// DIFF
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Deleted,
    Mutated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Entity,
    Relationship,
}

/// One record that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftItem {
    pub record: RecordKind,
    pub change: ChangeKind,
    pub instance_id: String,
    pub type_code: String,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// Every difference between a baseline and a current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftDiff {
    pub tenant_id: TenantId,
    pub baseline_snapshot: String,
    pub current_snapshot: String,
    pub items: Vec<DriftItem>,
}

impl DriftDiff {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn count(&self, change: ChangeKind) -> usize {
        self.items.iter().filter(|i| i.change == change).count()
    }
}

/// Compare two snapshots of the same tenant, keyed by instance id.
pub fn diff(baseline: &Snapshot, current: &Snapshot) -> Result<DriftDiff, CoreError> {
    if baseline.tenant_id != current.tenant_id {
        return Err(CoreError::Validation(format!(
            "cannot diff tenant '{}' against tenant '{}'",
            baseline.tenant_id, current.tenant_id
        )));
    }

    let mut items = Vec::new();

    let entities = |s: &Snapshot| -> BTreeMap<String, (String, String)> {
        s.entity_digests
            .iter()
            .map(|d| (d.instance_id.clone(), (d.type_code.clone(), d.content_hash.clone())))
            .collect()
    };
    compare(
        RecordKind::Entity,
        &entities(baseline),
        &entities(current),
        &mut items,
    );

    let relationships = |s: &Snapshot| -> BTreeMap<String, (String, String)> {
        s.relationship_digests
            .iter()
            .map(|d| (d.instance_id.clone(), (d.type_code.clone(), d.effective_hash.clone())))
            .collect()
    };
    compare(
        RecordKind::Relationship,
        &relationships(baseline),
        &relationships(current),
        &mut items,
    );

    Ok(DriftDiff {
        tenant_id: baseline.tenant_id.clone(),
        baseline_snapshot: baseline.snapshot_id.clone(),
        current_snapshot: current.snapshot_id.clone(),
        items,
    })
}

fn compare(
    record: RecordKind,
    before: &BTreeMap<String, (String, String)>,
    after: &BTreeMap<String, (String, String)>,
    out: &mut Vec<DriftItem>,
) {
    for (id, (type_code, old)) in before {
        match after.get(id) {
            None => out.push(DriftItem {
                record,
                change: ChangeKind::Deleted,
                instance_id: id.clone(),
                type_code: type_code.clone(),
                before: Some(old.clone()),
                after: None,
            }),
            Some((_, new)) if new != old => out.push(DriftItem {
                record,
                change: ChangeKind::Mutated,
                instance_id: id.clone(),
                type_code: type_code.clone(),
                before: Some(old.clone()),
                after: Some(new.clone()),
            }),
            Some(_) => {}
        }
    }
    for (id, (type_code, new)) in after {
        if !before.contains_key(id) {
            out.push(DriftItem {
                record,
                change: ChangeKind::Added,
                instance_id: id.clone(),
                type_code: type_code.clone(),
                before: None,
                after: Some(new.clone()),
            });
        }
    }
}

// =============================================================================
// ALLOWLIST
// =============================================================================

/// One allowlist rule as written in configuration.
///
/// A rule matches when every field it sets matches. An empty
/// `change_kinds` list matches every kind of change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AllowRule {
    #[serde(default)]
    pub type_code: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub change_kinds: Vec<ChangeKind>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    type_code: Option<String>,
    instance_id: Option<Pattern>,
    change_kinds: Vec<ChangeKind>,
}

impl CompiledRule {
    fn matches(&self, item: &DriftItem) -> bool {
        self.type_code.as_ref().is_none_or(|t| *t == item.type_code)
            && self
                .instance_id
                .as_ref()
                .is_none_or(|p| p.matches(&item.instance_id))
            && (self.change_kinds.is_empty() || self.change_kinds.contains(&item.change))
    }
}

/// Compiled set of expected-drift rules.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    rules: Vec<CompiledRule>,
}

impl Allowlist {
    /// Compile rules. Malformed globs and empty rules are rejected.
    pub fn new(rules: &[AllowRule]) -> Result<Self, CoreError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.type_code.is_none() && rule.instance_id.is_none() {
                return Err(CoreError::Validation(
                    "allowlist rule needs a type_code or an instance_id pattern".into(),
                ));
            }
            let instance_id = rule
                .instance_id
                .as_deref()
                .map(Pattern::new)
                .transpose()
                .map_err(|e| CoreError::Validation(format!("bad allowlist glob: {}", e)))?;
            compiled.push(CompiledRule {
                type_code: rule.type_code.clone(),
                instance_id,
                change_kinds: rule.change_kinds.clone(),
            });
        }
        Ok(Self { rules: compiled })
    }

    #[must_use]
    pub fn allows(&self, item: &DriftItem) -> bool {
        self.rules.iter().any(|r| r.matches(item))
    }
}

// =============================================================================
// SIGNALS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Error,
}

impl Severity {
    /// Deletions and mutations are errors; additions are warnings.
    #[must_use]
    pub fn for_change(change: ChangeKind) -> Self {
        match change {
            ChangeKind::Added => Self::Warning,
            ChangeKind::Deleted | ChangeKind::Mutated => Self::Error,
        }
    }
}

/// One unexpected-drift notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftSignal {
    pub signal_id: String,
    pub emitted_at: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub severity: Severity,
    pub baseline_snapshot: String,
    pub current_snapshot: String,
    #[serde(flatten)]
    pub item: DriftItem,
}

/// Destination for drift signals.
pub trait SignalSink: Send + Sync {
    fn emit(&self, signal: &DriftSignal) -> Result<(), CoreError>;
}

/// Appends signals to `<root>/<tenant_id>/drift_signals.jsonl`.
#[derive(Debug)]
pub struct JsonlSignalSink {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlSignalSink {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path_for(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str()).join(DRIFT_SIGNAL_FILE_NAME)
    }
}

impl SignalSink for JsonlSignalSink {
    fn emit(&self, signal: &DriftSignal) -> Result<(), CoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CoreError::Io("signal sink lock poisoned".into()))?;
        let path = self.path_for(&signal.tenant_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(signal)?;
        line.push('\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

// =============================================================================
// GATE
// =============================================================================

/// Verdict of the drift gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateReport {
    pub passed: bool,
    pub added: usize,
    pub deleted: usize,
    pub mutated: usize,
    pub expected: Vec<DriftItem>,
    pub unexpected: Vec<DriftItem>,
    pub signals_emitted: usize,
    pub signals_failed: usize,
}

/// Split drift into expected/unexpected and signal the unexpected part.
pub fn evaluate_gate(diff: &DriftDiff, allowlist: &Allowlist, sink: &dyn SignalSink) -> GateReport {
    let (expected, unexpected): (Vec<DriftItem>, Vec<DriftItem>) =
        diff.items.iter().cloned().partition(|i| allowlist.allows(i));

    let mut signals_emitted = 0;
    let mut signals_failed = 0;
    for item in &unexpected {
        let signal = DriftSignal {
            signal_id: uuid::Uuid::new_v4().to_string(),
            emitted_at: Utc::now(),
            tenant_id: diff.tenant_id.clone(),
            severity: Severity::for_change(item.change),
            baseline_snapshot: diff.baseline_snapshot.clone(),
            current_snapshot: diff.current_snapshot.clone(),
            item: item.clone(),
        };
        match sink.emit(&signal) {
            Ok(()) => signals_emitted += 1,
            Err(e) => {
                signals_failed += 1;
                warn!(
                    tenant = %diff.tenant_id,
                    instance_id = %item.instance_id,
                    error = %e,
                    "drift signal not delivered"
                );
            }
        }
    }

    let passed = unexpected.is_empty();
    info!(
        tenant = %diff.tenant_id,
        passed,
        expected = expected.len(),
        unexpected = unexpected.len(),
        "drift gate evaluated"
    );
    GateReport {
        passed,
        added: diff.count(ChangeKind::Added),
        deleted: diff.count(ChangeKind::Deleted),
        mutated: diff.count(ChangeKind::Mutated),
        expected,
        unexpected,
        signals_emitted,
        signals_failed,
    }
}
