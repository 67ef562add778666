//! # Authoritative Record Store (SQLite)
//!
//! Owns identity: surrogate ids, content hashes and the ledger outbox.
//!
//! Every statement binds `tenant_id`; SQLite has no row-level security, so
//! tenant isolation lives in the SQL itself. Each upsert runs in one
//! `IMMEDIATE` transaction that also inserts the ledger outbox row, so the
//! data change and its ledger entry commit or roll back together.

use crate::hashing::{entity_content_hash, relationship_content_hash};
use crate::ledger::LedgerEntry;
use crate::primitives::MAX_PAGE_LIMIT;
use crate::types::{
    Attributes, Confidence, CoreError, Entity, EpochContext, Evidence, ExtractedEntity,
    ExtractedRelationship, Operation, Page, Relationship, SurrogateId, TenantId, UpsertOutcome,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const ENTITY_COLUMNS: &str = "surrogate_id, type_code, instance_id, name, attributes_json, \
     content_hash, source_file, line_start, line_end, extracted_at";

const RELATIONSHIP_SELECT: &str = "SELECT r.surrogate_id, r.type_code, r.instance_id, r.name, \
     r.from_surrogate_id, r.to_surrogate_id, f.instance_id, t.instance_id, r.confidence_milli, \
     r.content_hash, r.source_file, r.line_start, r.line_end, r.extracted_at \
     FROM relationships r \
     JOIN entities f ON f.surrogate_id = r.from_surrogate_id \
     JOIN entities t ON t.surrogate_id = r.to_surrogate_id";

/// A ledger entry committed alongside a store mutation but not yet flushed.
#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub seq: i64,
    pub entry: LedgerEntry,
}

/// SQLite-backed authoritative store.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::with_connection(conn)
    }

    /// Private in-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, CoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CoreError> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Storage("record store lock poisoned".into()))
    }

    // =========================================================================
    // UPSERT
    // =========================================================================

    /// Create, update or leave untouched one entity.
    ///
    /// CREATE and UPDATE write an outbox row in the same transaction.
    pub fn upsert_entity(
        &self,
        tenant: &TenantId,
        extracted: &ExtractedEntity,
        epoch: &EpochContext,
    ) -> Result<UpsertOutcome<Entity>, CoreError> {
        extracted.validate()?;
        let hash = entity_content_hash(
            &extracted.type_code,
            &extracted.instance_id,
            &extracted.name,
            &extracted.attributes,
        )?;
        let attributes_json = serde_json::to_string(&extracted.attributes)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT surrogate_id, content_hash FROM entities
                 WHERE tenant_id = ?1 AND instance_id = ?2",
                params![tenant.as_str(), extracted.instance_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (surrogate, operation) = match existing {
            Some((id, current)) if current == hash => (id, Operation::NoOp),
            Some((id, _)) => {
                tx.execute(
                    "UPDATE entities SET type_code = ?3, name = ?4, attributes_json = ?5,
                         content_hash = ?6, source_file = ?7, line_start = ?8, line_end = ?9,
                         extracted_at = ?10
                     WHERE tenant_id = ?1 AND surrogate_id = ?2",
                    params![
                        tenant.as_str(),
                        id,
                        extracted.type_code,
                        extracted.name,
                        attributes_json,
                        hash,
                        extracted.evidence.source_file,
                        extracted.evidence.line_start,
                        extracted.evidence.line_end,
                        now,
                    ],
                )?;
                (id, Operation::Update)
            }
            None => {
                tx.execute(
                    "INSERT INTO entities (tenant_id, type_code, instance_id, name,
                         attributes_json, content_hash, source_file, line_start, line_end,
                         extracted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        tenant.as_str(),
                        extracted.type_code,
                        extracted.instance_id,
                        extracted.name,
                        attributes_json,
                        hash,
                        extracted.evidence.source_file,
                        extracted.evidence.line_start,
                        extracted.evidence.line_end,
                        now,
                    ],
                )?;
                (tx.last_insert_rowid(), Operation::Create)
            }
        };

        if operation != Operation::NoOp {
            let entry = LedgerEntry::for_entity(tenant, extracted, operation, &hash, epoch);
            insert_outbox(&tx, tenant, &entry)?;
        }

        let record = load_entity(&tx, tenant, SurrogateId(surrogate))?
            .ok_or_else(|| CoreError::Storage(format!("entity {} vanished", surrogate)))?;
        tx.commit()?;
        Ok(UpsertOutcome { record, operation })
    }

    /// Create, update or leave untouched one relationship.
    ///
    /// Both endpoints must already exist in this tenant.
    pub fn upsert_relationship(
        &self,
        tenant: &TenantId,
        extracted: &ExtractedRelationship,
        epoch: &EpochContext,
    ) -> Result<UpsertOutcome<Relationship>, CoreError> {
        extracted.validate()?;
        let instance_id = extracted.instance_id();
        let hash = relationship_content_hash(
            &extracted.type_code,
            &instance_id,
            &extracted.name,
            &extracted.from_instance_id,
            &extracted.to_instance_id,
            extracted.confidence,
        );
        let now = Utc::now().to_rfc3339();

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let from = resolve_endpoint(&tx, tenant, &instance_id, &extracted.from_instance_id)?;
        let to = resolve_endpoint(&tx, tenant, &instance_id, &extracted.to_instance_id)?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT surrogate_id, content_hash FROM relationships
                 WHERE tenant_id = ?1 AND instance_id = ?2",
                params![tenant.as_str(), instance_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (surrogate, operation) = match existing {
            Some((id, current)) if current == hash => (id, Operation::NoOp),
            Some((id, _)) => {
                tx.execute(
                    "UPDATE relationships SET name = ?3, from_surrogate_id = ?4,
                         to_surrogate_id = ?5, confidence_milli = ?6, content_hash = ?7,
                         source_file = ?8, line_start = ?9, line_end = ?10, extracted_at = ?11
                     WHERE tenant_id = ?1 AND surrogate_id = ?2",
                    params![
                        tenant.as_str(),
                        id,
                        extracted.name,
                        from,
                        to,
                        extracted.confidence.thousandths(),
                        hash,
                        extracted.evidence.source_file,
                        extracted.evidence.line_start,
                        extracted.evidence.line_end,
                        now,
                    ],
                )?;
                (id, Operation::Update)
            }
            None => {
                tx.execute(
                    "INSERT INTO relationships (tenant_id, type_code, instance_id, name,
                         from_surrogate_id, to_surrogate_id, confidence_milli, content_hash,
                         source_file, line_start, line_end, extracted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    params![
                        tenant.as_str(),
                        extracted.type_code,
                        instance_id,
                        extracted.name,
                        from,
                        to,
                        extracted.confidence.thousandths(),
                        hash,
                        extracted.evidence.source_file,
                        extracted.evidence.line_start,
                        extracted.evidence.line_end,
                        now,
                    ],
                )?;
                (tx.last_insert_rowid(), Operation::Create)
            }
        };

        if operation != Operation::NoOp {
            let entry = LedgerEntry::for_relationship(tenant, extracted, operation, &hash, epoch);
            insert_outbox(&tx, tenant, &entry)?;
        }

        let record = query_relationships(
            &tx,
            tenant,
            "AND r.surrogate_id = ?2",
            params![tenant.as_str(), surrogate],
        )?
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::Storage(format!("relationship {} vanished", surrogate)))?;
        tx.commit()?;
        Ok(UpsertOutcome { record, operation })
    }

    // =========================================================================
    // LOOKUPS
    // =========================================================================

    pub fn entity_by_instance(
        &self,
        tenant: &TenantId,
        instance_id: &str,
    ) -> Result<Option<Entity>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM entities WHERE tenant_id = ?1 AND instance_id = ?2",
            ENTITY_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![tenant.as_str(), instance_id], |row| {
                entity_from_row(row, tenant)
            })
            .optional()?)
    }

    pub fn entity_by_surrogate(
        &self,
        tenant: &TenantId,
        id: SurrogateId,
    ) -> Result<Option<Entity>, CoreError> {
        let conn = self.lock()?;
        load_entity(&conn, tenant, id)
    }

    pub fn relationship_by_instance(
        &self,
        tenant: &TenantId,
        instance_id: &str,
    ) -> Result<Option<Relationship>, CoreError> {
        let conn = self.lock()?;
        Ok(query_relationships(
            &conn,
            tenant,
            "AND r.instance_id = ?2",
            params![tenant.as_str(), instance_id],
        )?
        .into_iter()
        .next())
    }

    /// Relationships with `id` at either end, ordered by surrogate id.
    pub fn relationships_touching(
        &self,
        tenant: &TenantId,
        id: SurrogateId,
    ) -> Result<Vec<Relationship>, CoreError> {
        let conn = self.lock()?;
        query_relationships(
            &conn,
            tenant,
            "AND (r.from_surrogate_id = ?2 OR r.to_surrogate_id = ?2)",
            params![tenant.as_str(), id.0],
        )
    }

    // =========================================================================
    // ENUMERATION
    // =========================================================================

    /// One page of entities, optionally filtered by type.
    pub fn list_entities(
        &self,
        tenant: &TenantId,
        type_code: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Entity>, CoreError> {
        check_limit(limit)?;
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM entities
             WHERE tenant_id = ?1 AND (?2 IS NULL OR type_code = ?2)
             ORDER BY surrogate_id LIMIT ?3 OFFSET ?4",
            ENTITY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(
                params![tenant.as_str(), type_code, (limit + 1) as i64, offset as i64],
                |row| entity_from_row(row, tenant),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(paginate(items, limit, offset))
    }

    /// One page of relationships, optionally filtered by type.
    pub fn list_relationships(
        &self,
        tenant: &TenantId,
        type_code: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Page<Relationship>, CoreError> {
        check_limit(limit)?;
        let conn = self.lock()?;
        let items = query_relationships(
            &conn,
            tenant,
            "AND (?2 IS NULL OR r.type_code = ?2) ORDER BY r.surrogate_id LIMIT ?3 OFFSET ?4",
            params![tenant.as_str(), type_code, (limit + 1) as i64, offset as i64],
        )?;
        Ok(paginate(items, limit, offset))
    }

    /// Every live entity of a tenant, ordered by surrogate id.
    pub fn all_entities(&self, tenant: &TenantId) -> Result<Vec<Entity>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM entities WHERE tenant_id = ?1 ORDER BY surrogate_id",
            ENTITY_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![tenant.as_str()], |row| entity_from_row(row, tenant))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Every live relationship of a tenant, ordered by surrogate id.
    pub fn all_relationships(&self, tenant: &TenantId) -> Result<Vec<Relationship>, CoreError> {
        let conn = self.lock()?;
        query_relationships(
            &conn,
            tenant,
            "ORDER BY r.surrogate_id",
            params![tenant.as_str()],
        )
    }

    pub fn entity_counts_by_type(
        &self,
        tenant: &TenantId,
    ) -> Result<BTreeMap<String, u64>, CoreError> {
        self.counts_by_type("entities", tenant)
    }

    pub fn relationship_counts_by_type(
        &self,
        tenant: &TenantId,
    ) -> Result<BTreeMap<String, u64>, CoreError> {
        self.counts_by_type("relationships", tenant)
    }

    fn counts_by_type(
        &self,
        table: &'static str,
        tenant: &TenantId,
    ) -> Result<BTreeMap<String, u64>, CoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT type_code, COUNT(*) FROM {} WHERE tenant_id = ?1 GROUP BY type_code",
            table
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut counts = BTreeMap::new();
        let rows = stmt.query_map(params![tenant.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (type_code, count) = row?;
            counts.insert(type_code, count as u64);
        }
        Ok(counts)
    }

    // =========================================================================
    // LEDGER OUTBOX
    // =========================================================================

    /// Queue a ledger entry that has no store mutation of its own.
    pub fn enqueue_ledger(&self, tenant: &TenantId, entry: &LedgerEntry) -> Result<(), CoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_outbox(&tx, tenant, entry)?;
        tx.commit()?;
        Ok(())
    }

    /// Outbox rows not yet flushed, oldest first.
    pub fn pending_outbox(&self, tenant: &TenantId) -> Result<Vec<OutboxRow>, CoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, entry_json FROM ledger_outbox WHERE tenant_id = ?1 ORDER BY seq",
        )?;
        let raw = stmt
            .query_map(params![tenant.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter()
            .map(|(seq, json)| {
                Ok(OutboxRow {
                    seq,
                    entry: serde_json::from_str(&json)?,
                })
            })
            .collect()
    }

    /// Tenants with at least one pending outbox row.
    pub fn outbox_tenants(&self) -> Result<Vec<TenantId>, CoreError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT DISTINCT tenant_id FROM ledger_outbox ORDER BY tenant_id")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names.into_iter().map(TenantId::parse).collect()
    }

    /// Drop flushed outbox rows.
    pub fn delete_outbox(&self, tenant: &TenantId, seqs: &[i64]) -> Result<(), CoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for seq in seqs {
            tx.execute(
                "DELETE FROM ledger_outbox WHERE tenant_id = ?1 AND seq = ?2",
                params![tenant.as_str(), seq],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

// =============================================================================
// SCHEMA
// =============================================================================

fn migrate(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS entities (
          surrogate_id INTEGER PRIMARY KEY AUTOINCREMENT,
          tenant_id TEXT NOT NULL,
          type_code TEXT NOT NULL,
          instance_id TEXT NOT NULL,
          name TEXT NOT NULL,
          attributes_json TEXT NOT NULL,
          content_hash TEXT NOT NULL,
          source_file TEXT NOT NULL,
          line_start INTEGER NOT NULL,
          line_end INTEGER NOT NULL,
          extracted_at TEXT NOT NULL,
          UNIQUE (tenant_id, instance_id)
        );

        CREATE TABLE IF NOT EXISTS relationships (
          surrogate_id INTEGER PRIMARY KEY AUTOINCREMENT,
          tenant_id TEXT NOT NULL,
          type_code TEXT NOT NULL,
          instance_id TEXT NOT NULL,
          name TEXT NOT NULL,
          from_surrogate_id INTEGER NOT NULL REFERENCES entities(surrogate_id),
          to_surrogate_id INTEGER NOT NULL REFERENCES entities(surrogate_id),
          confidence_milli INTEGER NOT NULL,
          content_hash TEXT NOT NULL,
          source_file TEXT NOT NULL,
          line_start INTEGER NOT NULL,
          line_end INTEGER NOT NULL,
          extracted_at TEXT NOT NULL,
          UNIQUE (tenant_id, instance_id)
        );

        CREATE TABLE IF NOT EXISTS ledger_outbox (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          tenant_id TEXT NOT NULL,
          entry_id TEXT NOT NULL UNIQUE,
          entry_json TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entities_tenant_type ON entities(tenant_id, type_code);
        CREATE INDEX IF NOT EXISTS idx_relationships_tenant_type ON relationships(tenant_id, type_code);
        CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(tenant_id, from_surrogate_id);
        CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(tenant_id, to_surrogate_id);
        "#,
    )?;
    Ok(())
}

// =============================================================================
// ROW HELPERS
// =============================================================================

fn check_limit(limit: usize) -> Result<(), CoreError> {
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(CoreError::Validation(format!(
            "limit must be between 1 and {}",
            MAX_PAGE_LIMIT
        )));
    }
    Ok(())
}

fn paginate<T>(mut items: Vec<T>, limit: usize, offset: usize) -> Page<T> {
    let has_more = items.len() > limit;
    items.truncate(limit);
    Page {
        items,
        limit,
        offset,
        has_more,
    }
}

fn insert_outbox(
    tx: &Transaction<'_>,
    tenant: &TenantId,
    entry: &LedgerEntry,
) -> Result<(), CoreError> {
    tx.execute(
        "INSERT INTO ledger_outbox (tenant_id, entry_id, entry_json) VALUES (?1, ?2, ?3)",
        params![
            tenant.as_str(),
            entry.entry_id,
            serde_json::to_string(entry)?
        ],
    )?;
    Ok(())
}

fn resolve_endpoint(
    conn: &Connection,
    tenant: &TenantId,
    relationship: &str,
    endpoint: &str,
) -> Result<i64, CoreError> {
    conn.query_row(
        "SELECT surrogate_id FROM entities WHERE tenant_id = ?1 AND instance_id = ?2",
        params![tenant.as_str(), endpoint],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| CoreError::EndpointMissing {
        relationship: relationship.to_string(),
        endpoint: endpoint.to_string(),
    })
}

fn load_entity(
    conn: &Connection,
    tenant: &TenantId,
    id: SurrogateId,
) -> Result<Option<Entity>, CoreError> {
    let sql = format!(
        "SELECT {} FROM entities WHERE tenant_id = ?1 AND surrogate_id = ?2",
        ENTITY_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![tenant.as_str(), id.0], |row| {
            entity_from_row(row, tenant)
        })
        .optional()?)
}

fn query_relationships(
    conn: &Connection,
    tenant: &TenantId,
    clause: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Relationship>, CoreError> {
    let sql = format!("{} WHERE r.tenant_id = ?1 {}", RELATIONSHIP_SELECT, clause);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, |row| relationship_from_row(row, tenant))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn conversion_error(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

fn timestamp(row: &Row<'_>, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e))
}

fn entity_from_row(row: &Row<'_>, tenant: &TenantId) -> rusqlite::Result<Entity> {
    let attributes_json: String = row.get(4)?;
    let attributes: Attributes =
        serde_json::from_str(&attributes_json).map_err(|e| conversion_error(4, e))?;
    Ok(Entity {
        surrogate_id: SurrogateId(row.get(0)?),
        tenant_id: tenant.clone(),
        type_code: row.get(1)?,
        instance_id: row.get(2)?,
        name: row.get(3)?,
        attributes,
        content_hash: row.get(5)?,
        evidence: Evidence {
            source_file: row.get(6)?,
            line_start: row.get(7)?,
            line_end: row.get(8)?,
        },
        extracted_at: timestamp(row, 9)?,
    })
}

fn relationship_from_row(row: &Row<'_>, tenant: &TenantId) -> rusqlite::Result<Relationship> {
    let confidence =
        Confidence::from_thousandths(row.get(8)?).map_err(|e| conversion_error(8, e))?;
    Ok(Relationship {
        surrogate_id: SurrogateId(row.get(0)?),
        tenant_id: tenant.clone(),
        type_code: row.get(1)?,
        instance_id: row.get(2)?,
        name: row.get(3)?,
        from_surrogate_id: SurrogateId(row.get(4)?),
        to_surrogate_id: SurrogateId(row.get(5)?),
        from_instance_id: row.get(6)?,
        to_instance_id: row.get(7)?,
        confidence,
        content_hash: row.get(9)?,
        evidence: Evidence {
            source_file: row.get(10)?,
            line_start: row.get(11)?,
            line_end: row.get(12)?,
        },
        extracted_at: timestamp(row, 13)?,
    })
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;
    use serde_json::json;

    fn tenant(name: &str) -> TenantId {
        TenantId::parse(name).expect("tenant")
    }

    fn epoch() -> EpochContext {
        EpochContext::with_epoch_id("epoch-test", "rev-1")
    }

    fn entity(id: &str, title: &str) -> ExtractedEntity {
        let mut attributes = Attributes::new();
        attributes.insert("title".into(), json!(title));
        ExtractedEntity {
            type_code: "STORY".into(),
            instance_id: id.into(),
            name: id.into(),
            attributes,
            evidence: Evidence::new("docs/brd.md", 1, 2),
        }
    }

    fn relationship(from: &str, to: &str, milli: u16) -> ExtractedRelationship {
        ExtractedRelationship {
            type_code: "R02".into(),
            from_instance_id: from.into(),
            to_instance_id: to.into(),
            name: String::new(),
            confidence: Confidence::from_thousandths(milli).expect("confidence"),
            evidence: Evidence::new("src/lib.rs", 10, 12),
        }
    }

    #[test]
    fn create_noop_update_cycle() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");

        let created = store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("create");
        assert_eq!(created.operation, Operation::Create);

        let same = store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("noop");
        assert_eq!(same.operation, Operation::NoOp);
        assert_eq!(same.record.surrogate_id, created.record.surrogate_id);

        let changed = store.upsert_entity(&t, &entity("S-1", "B"), &epoch()).expect("update");
        assert_eq!(changed.operation, Operation::Update);
        assert_eq!(changed.record.surrogate_id, created.record.surrogate_id);
        assert_ne!(changed.record.content_hash, created.record.content_hash);
    }

    #[test]
    fn outbox_only_records_mutations() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");
        store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("create");
        store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("noop");

        let pending = store.pending_outbox(&t).expect("outbox");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entry.operation, Operation::Create);

        store
            .delete_outbox(&t, &[pending[0].seq])
            .expect("delete");
        assert!(store.pending_outbox(&t).expect("outbox").is_empty());
    }

    #[test]
    fn enqueued_entries_keep_commit_order() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");
        store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("create");
        let decision = LedgerEntry::decision(&t, "closure-1", "CLOSURE", &epoch(), "PASS");
        store.enqueue_ledger(&t, &decision).expect("enqueue");

        let ops: Vec<Operation> = store
            .pending_outbox(&t)
            .expect("outbox")
            .into_iter()
            .map(|row| row.entry.operation)
            .collect();
        assert_eq!(ops, vec![Operation::Create, Operation::Decision]);
        assert!(store.enqueue_ledger(&t, &decision).is_err(), "entry ids are unique");
    }

    #[test]
    fn tenants_are_isolated() {
        let store = RecordStore::open_in_memory().expect("store");
        let a = tenant("alpha");
        let b = tenant("beta");
        let in_a = store.upsert_entity(&a, &entity("S-1", "A"), &epoch()).expect("a");
        let in_b = store.upsert_entity(&b, &entity("S-1", "A"), &epoch()).expect("b");

        assert_eq!(in_b.operation, Operation::Create);
        assert_ne!(in_a.record.surrogate_id, in_b.record.surrogate_id);
        assert!(
            store
                .entity_by_surrogate(&b, in_a.record.surrogate_id)
                .expect("lookup")
                .is_none()
        );
    }

    #[test]
    fn relationship_requires_both_endpoints() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");
        store.upsert_entity(&t, &entity("A", "a"), &epoch()).expect("A");

        let err = store
            .upsert_relationship(&t, &relationship("A", "B", 900), &epoch())
            .expect_err("B missing");
        assert_eq!(err.kind(), ErrorKind::EndpointMissing);
        assert_eq!(store.pending_outbox(&t).expect("outbox").len(), 1);
    }

    #[test]
    fn relationship_confidence_change_is_update() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");
        store.upsert_entity(&t, &entity("A", "a"), &epoch()).expect("A");
        store.upsert_entity(&t, &entity("B", "b"), &epoch()).expect("B");

        let first = store
            .upsert_relationship(&t, &relationship("A", "B", 900), &epoch())
            .expect("create");
        assert_eq!(first.operation, Operation::Create);
        assert_eq!(first.record.instance_id, "R02:A->B");
        assert_eq!(first.record.from_instance_id, "A");

        let second = store
            .upsert_relationship(&t, &relationship("A", "B", 500), &epoch())
            .expect("update");
        assert_eq!(second.operation, Operation::Update);
        assert_eq!(second.record.surrogate_id, first.record.surrogate_id);
    }

    #[test]
    fn pages_report_has_more() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");
        for i in 0..5 {
            store
                .upsert_entity(&t, &entity(&format!("S-{}", i), "x"), &epoch())
                .expect("create");
        }
        let first = store.list_entities(&t, None, 3, 0).expect("page");
        assert_eq!(first.items.len(), 3);
        assert!(first.has_more);

        let last = store.list_entities(&t, Some("STORY"), 3, 3).expect("page");
        assert_eq!(last.items.len(), 2);
        assert!(!last.has_more);

        assert!(store.list_entities(&t, Some("EPIC"), 3, 0).expect("page").items.is_empty());
        assert!(store.list_entities(&t, None, 0, 0).is_err());
        assert!(store.list_entities(&t, None, MAX_PAGE_LIMIT + 1, 0).is_err());
    }

    #[test]
    fn counts_group_by_type() {
        let store = RecordStore::open_in_memory().expect("store");
        let t = tenant("acme");
        store.upsert_entity(&t, &entity("A", "a"), &epoch()).expect("A");
        store.upsert_entity(&t, &entity("B", "b"), &epoch()).expect("B");
        store
            .upsert_relationship(&t, &relationship("A", "B", 900), &epoch())
            .expect("rel");

        assert_eq!(
            store.entity_counts_by_type(&t).expect("counts").get("STORY"),
            Some(&2)
        );
        assert_eq!(
            store.relationship_counts_by_type(&t).expect("counts").get("R02"),
            Some(&1)
        );
    }

    #[test]
    fn reopen_keeps_surrogate_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("records.db");
        let t = tenant("acme");
        let first = {
            let store = RecordStore::open(&path).expect("open");
            store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("create")
        };
        let store = RecordStore::open(&path).expect("reopen");
        let again = store.upsert_entity(&t, &entity("S-1", "A"), &epoch()).expect("noop");
        assert_eq!(again.operation, Operation::NoOp);
        assert_eq!(again.record.surrogate_id, first.record.surrogate_id);
    }
}
