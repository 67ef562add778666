//! # Provenance Ledger
//!
//! Append-only, per-tenant JSONL log of every mutation and decision.
//!
//! Layout: `<ledger-root>/<tenant_id>/ledger.jsonl`, one [`LedgerEntry`] per
//! line. Entries are never edited or removed.
//!
//! Nothing writes here directly. Store mutations commit an outbox row in the
//! same SQLite transaction as the data change, decisions are queued in the
//! same outbox, and the outbox is flushed into the file with
//! [`Ledger::append_unique`], which skips entry ids that already made it to
//! disk. That keeps the file free of both gaps and duplicates across crashes.

use crate::primitives::LEDGER_FILE_NAME;
use crate::types::{
    CoreError, EpochContext, Evidence, ExtractedEntity, ExtractedRelationship, Operation, TenantId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Which kind of record an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerKind {
    Entity,
    Relationship,
    Decision,
}

/// One ledger line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub kind: LedgerKind,
    pub operation: Operation,
    pub instance_id: String,
    pub type_code: String,
    #[serde(flatten)]
    pub evidence: Option<Evidence>,
    pub epoch_id: String,
    pub repo_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl LedgerEntry {
    fn base(
        tenant: &TenantId,
        kind: LedgerKind,
        operation: Operation,
        instance_id: String,
        type_code: String,
        epoch: &EpochContext,
    ) -> Self {
        Self {
            entry_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            tenant_id: tenant.clone(),
            kind,
            operation,
            instance_id,
            type_code,
            evidence: None,
            epoch_id: epoch.epoch_id.clone(),
            repo_revision: epoch.repo_revision.clone(),
            content_hash: None,
            detail: None,
        }
    }

    #[must_use]
    pub fn for_entity(
        tenant: &TenantId,
        entity: &ExtractedEntity,
        operation: Operation,
        content_hash: &str,
        epoch: &EpochContext,
    ) -> Self {
        let mut entry = Self::base(
            tenant,
            LedgerKind::Entity,
            operation,
            entity.instance_id.clone(),
            entity.type_code.clone(),
            epoch,
        );
        entry.evidence = Some(entity.evidence.clone());
        entry.content_hash = Some(content_hash.to_string());
        entry
    }

    #[must_use]
    pub fn for_relationship(
        tenant: &TenantId,
        relationship: &ExtractedRelationship,
        operation: Operation,
        content_hash: &str,
        epoch: &EpochContext,
    ) -> Self {
        let mut entry = Self::base(
            tenant,
            LedgerKind::Relationship,
            operation,
            relationship.instance_id(),
            relationship.type_code.clone(),
            epoch,
        );
        entry.evidence = Some(relationship.evidence.clone());
        entry.content_hash = Some(content_hash.to_string());
        entry
    }

    /// A DECISION entry. `subject` names what was decided about.
    #[must_use]
    pub fn decision(
        tenant: &TenantId,
        subject: impl Into<String>,
        type_code: impl Into<String>,
        epoch: &EpochContext,
        detail: impl Into<String>,
    ) -> Self {
        let mut entry = Self::base(
            tenant,
            LedgerKind::Decision,
            Operation::Decision,
            subject.into(),
            type_code.into(),
            epoch,
        );
        entry.detail = Some(detail.into());
        entry
    }
}

/// File-backed ledger rooted at one directory.
///
/// The upsert engine's outbox flush is the only writer, so an entry that
/// reached the file during an interrupted flush is always among the last
/// lines. Appends rely on that and never scan the whole file.
#[derive(Debug)]
pub struct Ledger {
    root: PathBuf,
    // Serializes appends so concurrent flushes cannot interleave lines.
    write_lock: Mutex<()>,
}

/// Bytes read per step when scanning a ledger file backwards.
const TAIL_CHUNK: u64 = 8 * 1024;

#[derive(Deserialize)]
struct EntryIdOnly {
    entry_id: String,
}

impl Ledger {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a tenant's ledger file.
    #[must_use]
    pub fn path_for(&self, tenant: &TenantId) -> PathBuf {
        self.root.join(tenant.as_str()).join(LEDGER_FILE_NAME)
    }

    /// Append the entries that are not already at the end of the file.
    ///
    /// A final line without its newline is what a crash mid-append leaves
    /// behind; it is cut off before anything new is written. Returns how
    /// many entries were written.
    pub fn append_unique(
        &self,
        tenant: &TenantId,
        entries: &[LedgerEntry],
    ) -> Result<usize, CoreError> {
        if let Some(stray) = entries.iter().find(|e| e.tenant_id != *tenant) {
            return Err(CoreError::Validation(format!(
                "ledger entry for tenant '{}' routed to '{}'",
                stray.tenant_id, tenant
            )));
        }
        if entries.is_empty() {
            return Ok(0);
        }
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CoreError::Io("ledger lock poisoned".into()))?;

        let path = self.path_for(tenant);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = cut_torn_tail(&mut file, &path)?;
        let present = tail_entry_ids(&mut file, len, entries.len())?;

        let mut buf = String::new();
        let mut written = 0;
        for entry in entries.iter().filter(|e| !present.contains(&e.entry_id)) {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
            written += 1;
        }
        if written > 0 {
            file.seek(SeekFrom::Start(len))?;
            file.write_all(buf.as_bytes())?;
            file.sync_data()?;
        }
        Ok(written)
    }

    /// Read every entry for a tenant, oldest first. A missing file is empty.
    ///
    /// An unterminated final line that does not parse is an interrupted
    /// append and is skipped; any other malformed line is an error.
    pub fn read(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>, CoreError> {
        let path = self.path_for(tenant);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = BufReader::new(File::open(&path)?);
        let mut entries: Vec<LedgerEntry> = Vec::new();
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) if line.last() != Some(&b'\n') => {
                    warn!(path = %path.display(), error = %e, "skipping torn final ledger line");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(entries)
    }
}

/// Truncate a final line that lacks its newline. Returns the new length.
fn cut_torn_tail(file: &mut File, path: &Path) -> Result<u64, CoreError> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len.saturating_sub(1)))?;
    file.read_exact(&mut last)?;
    if last == [b'\n'] {
        return Ok(len);
    }
    let (start, bytes) = read_tail(file, len, 0)?;
    let keep = bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(start, |i| start + i as u64 + 1);
    warn!(
        path = %path.display(),
        dropped_bytes = len - keep,
        "truncating torn ledger line"
    );
    file.set_len(keep)?;
    file.sync_data()?;
    Ok(keep)
}

/// Entry ids of the last `lines` lines of a file that ends in a newline.
///
/// A line that does not parse was not written by a flush, so it cannot
/// hold a pending entry and is passed over.
fn tail_entry_ids(file: &mut File, len: u64, lines: usize) -> Result<BTreeSet<String>, CoreError> {
    if len == 0 || lines == 0 {
        return Ok(BTreeSet::new());
    }
    let (_, bytes) = read_tail(file, len, lines)?;
    Ok(bytes
        .split(|&b| b == b'\n')
        .filter(|l| !l.iter().all(u8::is_ascii_whitespace))
        .rev()
        .take(lines)
        .filter_map(|l| serde_json::from_slice::<EntryIdOnly>(l).ok())
        .map(|e| e.entry_id)
        .collect())
}

/// Read backwards from `len` until more than `lines` newlines are in hand
/// or the start of the file is reached. Returns the offset of the first
/// byte read and the bytes.
fn read_tail(file: &mut File, len: u64, lines: usize) -> std::io::Result<(u64, Vec<u8>)> {
    let mut start = len;
    let mut bytes = Vec::new();
    let mut newlines = 0;
    while start > 0 && newlines <= lines {
        let step = TAIL_CHUNK.min(start);
        start -= step;
        let mut chunk = vec![0u8; step as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|&&b| b == b'\n').count();
        chunk.extend_from_slice(&bytes);
        bytes = chunk;
    }
    Ok((start, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("acme").expect("tenant")
    }

    fn sample_entry() -> LedgerEntry {
        let entity = ExtractedEntity {
            type_code: "STORY".into(),
            instance_id: "STORY-1".into(),
            name: "Login".into(),
            attributes: Default::default(),
            evidence: Evidence::new("docs/brd.md", 4, 8),
        };
        LedgerEntry::for_entity(
            &tenant(),
            &entity,
            Operation::Create,
            "abc",
            &EpochContext::with_epoch_id("e1", "rev1"),
        )
    }

    fn append_raw(ledger: &Ledger, raw: &str) {
        let path = ledger.path_for(&tenant());
        fs::create_dir_all(path.parent().expect("parent")).expect("dir");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        file.write_all(raw.as_bytes()).expect("write");
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        assert!(ledger.read(&tenant()).expect("read").is_empty());
    }

    #[test]
    fn append_then_read_preserves_order_and_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        let first = sample_entry();
        let second = LedgerEntry::decision(
            &tenant(),
            "closure-1",
            "CLOSURE",
            &EpochContext::with_epoch_id("e2", "rev1"),
            "PASS",
        );
        let written = ledger
            .append_unique(&tenant(), &[first.clone(), second.clone()])
            .expect("append");
        assert_eq!(written, 2);

        let read = ledger.read(&tenant()).expect("read");
        assert_eq!(read, vec![first, second]);
        assert!(ledger.path_for(&tenant()).ends_with("acme/ledger.jsonl"));
    }

    #[test]
    fn entity_lines_carry_flat_evidence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        ledger.append_unique(&tenant(), &[sample_entry()]).expect("append");
        let raw = std::fs::read_to_string(ledger.path_for(&tenant())).expect("raw");
        let json: serde_json::Value = serde_json::from_str(raw.trim()).expect("json");
        assert_eq!(json["operation"], "CREATE");
        assert_eq!(json["kind"], "entity");
        assert_eq!(json["source_file"], "docs/brd.md");
        assert_eq!(json["line_start"], 4);
    }

    #[test]
    fn append_unique_skips_existing_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        let entry = sample_entry();
        assert_eq!(ledger.append_unique(&tenant(), &[entry.clone()]).expect("a"), 1);
        assert_eq!(ledger.append_unique(&tenant(), &[entry]).expect("b"), 0);
        assert_eq!(ledger.read(&tenant()).expect("read").len(), 1);
    }

    #[test]
    fn duplicate_check_only_reads_the_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        // A damaged line far from the end must not block appends.
        append_raw(&ledger, "not json\n");
        let history: Vec<LedgerEntry> = (0..300).map(|_| sample_entry()).collect();
        ledger.append_unique(&tenant(), &history).expect("history");

        let fresh = sample_entry();
        let retry = [history[298].clone(), history[299].clone(), fresh.clone()];
        assert_eq!(ledger.append_unique(&tenant(), &retry).expect("retry"), 1);

        let raw = std::fs::read_to_string(ledger.path_for(&tenant())).expect("raw");
        assert_eq!(raw.lines().count(), 302);
        assert!(raw.ends_with(&format!("{}\n", serde_json::to_string(&fresh).expect("json"))));
    }

    #[test]
    fn torn_final_line_is_skipped_on_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        let kept = sample_entry();
        ledger.append_unique(&tenant(), &[kept.clone()]).expect("append");
        append_raw(&ledger, r#"{"entry_id":"x","tena"#);

        assert_eq!(ledger.read(&tenant()).expect("read"), vec![kept]);
    }

    #[test]
    fn malformed_terminated_line_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        append_raw(&ledger, "{\"entry_id\":\n");
        assert!(matches!(
            ledger.read(&tenant()),
            Err(CoreError::Serialization(_))
        ));
    }

    #[test]
    fn append_cuts_torn_line_before_writing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        let first = sample_entry();
        let second = sample_entry();
        ledger.append_unique(&tenant(), &[first.clone()]).expect("first");

        // The crash hit halfway through writing `second`.
        let line = serde_json::to_string(&second).expect("json");
        append_raw(&ledger, &line[..line.len() / 2]);

        assert_eq!(ledger.append_unique(&tenant(), &[second.clone()]).expect("retry"), 1);
        let raw = std::fs::read_to_string(ledger.path_for(&tenant())).expect("raw");
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(ledger.read(&tenant()).expect("read"), vec![first, second]);
    }

    #[test]
    fn torn_line_without_any_newline_is_dropped_entirely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        append_raw(&ledger, r#"{"entry_id":"x"#);
        let entry = sample_entry();
        ledger.append_unique(&tenant(), &[entry.clone()]).expect("append");
        assert_eq!(ledger.read(&tenant()).expect("read"), vec![entry]);
    }

    #[test]
    fn rejects_cross_tenant_routing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::new(dir.path());
        let other = TenantId::parse("other").expect("tenant");
        assert!(ledger.append_unique(&other, &[sample_entry()]).is_err());
    }
}
