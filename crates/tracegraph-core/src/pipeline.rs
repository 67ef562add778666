//! # Ingestion Pipeline
//!
//! The seam between extraction and the engine. A pipeline knows which
//! source revision its facts came from and can run a full ingestion
//! (upsert + sync) under a given epoch.
//!
//! [`BundlePipeline`] is the concrete pipeline: it reads an extraction
//! bundle (a JSON file written by an external extractor) and pushes it
//! through the upsert engine and the graph sync engine.

use crate::sync::{GraphSync, MergeReport, SyncReport};
use crate::types::{CoreError, EpochContext, ExtractedEntity, ExtractedRelationship, TenantId};
use crate::upsert::{BatchSummary, UpsertEngine};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Output of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionBundle {
    /// Source revision the extractor ran against.
    pub revision: String,
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

impl ExtractionBundle {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Io(format!("{}: {}", path.display(), e)))?;
        let bundle: Self = serde_json::from_str(&raw)?;
        if bundle.revision.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "bundle {} has an empty revision",
                path.display()
            )));
        }
        Ok(bundle)
    }
}

/// What one pipeline run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub epoch_id: String,
    pub entities: BatchSummary,
    pub relationships: BatchSummary,
    pub merge: MergeReport,
    pub sync: SyncReport,
}

impl RunSummary {
    /// Items the upsert engine refused during this run.
    #[must_use]
    pub fn rejected(&self) -> usize {
        self.entities.failed + self.relationships.failed
    }
}

/// A full ingestion that can be re-run.
pub trait IngestionPipeline {
    fn tenant(&self) -> &TenantId;

    /// Revision the extracted facts claim to come from.
    fn recorded_revision(&self) -> Result<String, CoreError>;

    /// Revision the caller attests the source is at right now.
    fn current_revision(&self) -> Result<String, CoreError>;

    /// Ingest everything and sync the graph store.
    fn run(&self, epoch: &EpochContext) -> Result<RunSummary, CoreError>;
}

/// Pipeline that replays an extraction bundle.
#[derive(Debug)]
pub struct BundlePipeline<'a> {
    tenant: TenantId,
    bundle_path: PathBuf,
    attested_revision: String,
    upsert: &'a UpsertEngine,
    sync: &'a GraphSync,
}

impl<'a> BundlePipeline<'a> {
    #[must_use]
    pub fn new(
        tenant: TenantId,
        bundle_path: impl Into<PathBuf>,
        attested_revision: impl Into<String>,
        upsert: &'a UpsertEngine,
        sync: &'a GraphSync,
    ) -> Self {
        Self {
            tenant,
            bundle_path: bundle_path.into(),
            attested_revision: attested_revision.into(),
            upsert,
            sync,
        }
    }
}

impl IngestionPipeline for BundlePipeline<'_> {
    fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    fn recorded_revision(&self) -> Result<String, CoreError> {
        Ok(ExtractionBundle::load(&self.bundle_path)?.revision)
    }

    fn current_revision(&self) -> Result<String, CoreError> {
        Ok(self.attested_revision.clone())
    }

    fn run(&self, epoch: &EpochContext) -> Result<RunSummary, CoreError> {
        let bundle = ExtractionBundle::load(&self.bundle_path)?;
        info!(
            tenant = %self.tenant,
            epoch = %epoch.epoch_id,
            entities = bundle.entities.len(),
            relationships = bundle.relationships.len(),
            "ingesting bundle"
        );

        let entities = BatchSummary::of(&self.upsert.upsert_entities(
            &self.tenant,
            &bundle.entities,
            epoch,
        ));
        let relationships = BatchSummary::of(&self.upsert.upsert_relationships(
            &self.tenant,
            &bundle.relationships,
            epoch,
        ));
        let (merge, sync) = self.sync.sync_tenant(&self.tenant)?;

        Ok(RunSummary {
            epoch_id: epoch.epoch_id.clone(),
            entities,
            relationships,
            merge,
            sync,
        })
    }
}
