//! # Upsert Engine
//!
//! Content-hash idempotent create/update of extracted facts, with exactly
//! one ledger entry per mutation.
//!
//! The record store commits each mutation together with an outbox row.
//! This engine moves outbox rows into the JSONL ledger after the commit, on
//! start-up, and before any ledger read, so a crash between commit and
//! flush is repaired the next time anything looks at the ledger.
//!
//! Every ledger line goes through the outbox, including NO-OP and closure
//! decisions. The flush is the only writer of the ledger file.
//!
//! Batches run sequentially in input order. All writes share the record
//! store's single SQLite connection, and SQLite admits one writer at a time
//! anyway.

use crate::ledger::{Ledger, LedgerEntry};
use crate::storage::RecordStore;
use crate::types::{
    CoreError, Entity, EpochContext, ExtractedEntity, ExtractedRelationship, Operation,
    Relationship, TenantId, UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Tunables for the upsert engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpsertOptions {
    /// Append a NO-OP ledger entry when content is unchanged.
    pub record_noop_decisions: bool,
}

/// Per-operation tally of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl BatchSummary {
    #[must_use]
    pub fn of<T>(results: &[Result<UpsertOutcome<T>, CoreError>]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result {
                Ok(outcome) => match outcome.operation {
                    Operation::Create => summary.created += 1,
                    Operation::Update => summary.updated += 1,
                    Operation::NoOp | Operation::Decision => summary.unchanged += 1,
                },
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// Idempotent upsert over the authoritative store.
#[derive(Debug, Clone)]
pub struct UpsertEngine {
    records: Arc<RecordStore>,
    ledger: Arc<Ledger>,
    options: UpsertOptions,
    // Held from reading the outbox until its rows are deleted, so two
    // flushes never append overlapping sets of entries.
    flush_lock: Arc<Mutex<()>>,
}

impl UpsertEngine {
    /// Build the engine and flush any outbox rows left by a previous run.
    pub fn new(
        records: Arc<RecordStore>,
        ledger: Arc<Ledger>,
        options: UpsertOptions,
    ) -> Result<Self, CoreError> {
        let engine = Self {
            records,
            ledger,
            options,
            flush_lock: Arc::new(Mutex::new(())),
        };
        let recovered = engine.flush_all()?;
        if recovered > 0 {
            info!(recovered, "flushed pending ledger outbox entries");
        }
        Ok(engine)
    }

    #[must_use]
    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    #[must_use]
    pub fn options(&self) -> UpsertOptions {
        self.options
    }

    // =========================================================================
    // SINGLE ITEM
    // =========================================================================

    pub fn upsert_entity(
        &self,
        tenant: &TenantId,
        entity: &ExtractedEntity,
        epoch: &EpochContext,
    ) -> Result<UpsertOutcome<Entity>, CoreError> {
        let outcome = self.apply_entity(tenant, entity, epoch)?;
        self.flush_after_commit(tenant);
        Ok(outcome)
    }

    pub fn upsert_relationship(
        &self,
        tenant: &TenantId,
        relationship: &ExtractedRelationship,
        epoch: &EpochContext,
    ) -> Result<UpsertOutcome<Relationship>, CoreError> {
        let outcome = self.apply_relationship(tenant, relationship, epoch)?;
        self.flush_after_commit(tenant);
        Ok(outcome)
    }

    fn apply_entity(
        &self,
        tenant: &TenantId,
        entity: &ExtractedEntity,
        epoch: &EpochContext,
    ) -> Result<UpsertOutcome<Entity>, CoreError> {
        let outcome = self.records.upsert_entity(tenant, entity, epoch)?;
        debug!(
            tenant = %tenant,
            instance_id = %entity.instance_id,
            operation = %outcome.operation,
            epoch = %epoch.epoch_id,
            "entity upserted"
        );
        if outcome.operation == Operation::NoOp && self.options.record_noop_decisions {
            let entry = LedgerEntry::for_entity(
                tenant,
                entity,
                Operation::NoOp,
                &outcome.record.content_hash,
                epoch,
            );
            self.records.enqueue_ledger(tenant, &entry)?;
        }
        Ok(outcome)
    }

    fn apply_relationship(
        &self,
        tenant: &TenantId,
        relationship: &ExtractedRelationship,
        epoch: &EpochContext,
    ) -> Result<UpsertOutcome<Relationship>, CoreError> {
        let outcome = self.records.upsert_relationship(tenant, relationship, epoch)?;
        debug!(
            tenant = %tenant,
            instance_id = %outcome.record.instance_id,
            operation = %outcome.operation,
            epoch = %epoch.epoch_id,
            "relationship upserted"
        );
        if outcome.operation == Operation::NoOp && self.options.record_noop_decisions {
            let entry = LedgerEntry::for_relationship(
                tenant,
                relationship,
                Operation::NoOp,
                &outcome.record.content_hash,
                epoch,
            );
            self.records.enqueue_ledger(tenant, &entry)?;
        }
        Ok(outcome)
    }

    // =========================================================================
    // BATCH
    // =========================================================================

    /// Upsert many entities; each item reports its own outcome, in input order.
    pub fn upsert_entities(
        &self,
        tenant: &TenantId,
        entities: &[ExtractedEntity],
        epoch: &EpochContext,
    ) -> Vec<Result<UpsertOutcome<Entity>, CoreError>> {
        let results: Vec<_> = entities
            .iter()
            .map(|e| self.apply_entity(tenant, e, epoch))
            .collect();
        self.flush_after_commit(tenant);
        let summary = BatchSummary::of(&results);
        info!(
            tenant = %tenant,
            epoch = %epoch.epoch_id,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "entity batch upserted"
        );
        results
    }

    /// Upsert many relationships; each item reports its own outcome, in input order.
    pub fn upsert_relationships(
        &self,
        tenant: &TenantId,
        relationships: &[ExtractedRelationship],
        epoch: &EpochContext,
    ) -> Vec<Result<UpsertOutcome<Relationship>, CoreError>> {
        let results: Vec<_> = relationships
            .iter()
            .map(|r| self.apply_relationship(tenant, r, epoch))
            .collect();
        self.flush_after_commit(tenant);
        let summary = BatchSummary::of(&results);
        info!(
            tenant = %tenant,
            epoch = %epoch.epoch_id,
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            "relationship batch upserted"
        );
        results
    }

    // =========================================================================
    // LEDGER OUTBOX
    // =========================================================================

    fn flush_after_commit(&self, tenant: &TenantId) {
        // The commit already happened; a failed flush stays in the outbox
        // and is retried by the next flush.
        if let Err(e) = self.flush_outbox(tenant) {
            warn!(tenant = %tenant, error = %e, "ledger flush deferred");
        }
    }

    /// Move a tenant's pending outbox rows into its ledger file.
    pub fn flush_outbox(&self, tenant: &TenantId) -> Result<usize, CoreError> {
        let _guard = self
            .flush_lock
            .lock()
            .map_err(|_| CoreError::Io("ledger flush lock poisoned".into()))?;
        let pending = self.records.pending_outbox(tenant)?;
        if pending.is_empty() {
            return Ok(0);
        }
        let entries: Vec<LedgerEntry> = pending.iter().map(|row| row.entry.clone()).collect();
        let written = self.ledger.append_unique(tenant, &entries)?;
        let seqs: Vec<i64> = pending.iter().map(|row| row.seq).collect();
        self.records.delete_outbox(tenant, &seqs)?;
        debug!(tenant = %tenant, pending = seqs.len(), written, "ledger outbox flushed");
        Ok(written)
    }

    /// Flush every tenant's outbox.
    pub fn flush_all(&self) -> Result<usize, CoreError> {
        let mut written = 0;
        for tenant in self.records.outbox_tenants()? {
            written += self.flush_outbox(&tenant)?;
        }
        Ok(written)
    }

    /// Ledger contents for a tenant, after flushing its outbox.
    pub fn ledger_entries(&self, tenant: &TenantId) -> Result<Vec<LedgerEntry>, CoreError> {
        self.flush_outbox(tenant)?;
        self.ledger.read(tenant)
    }

    /// Queue a DECISION entry and flush it to the ledger.
    ///
    /// Once this returns the decision is durable in the outbox even if the
    /// flush itself was deferred.
    pub fn record_decision(&self, entry: LedgerEntry) -> Result<(), CoreError> {
        if entry.operation != Operation::Decision {
            return Err(CoreError::Validation(format!(
                "record_decision expects a DECISION entry, got {}",
                entry.operation
            )));
        }
        let tenant = entry.tenant_id.clone();
        self.records.enqueue_ledger(&tenant, &entry)?;
        self.flush_after_commit(&tenant);
        Ok(())
    }
}
