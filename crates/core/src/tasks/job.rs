use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::catalog::Catalog;
use crate::domain::{ArtifactKind, MediaKind};
use crate::encode::{EncodeRequest, Encoder};
use crate::error::{Error, Result};
use crate::metadata;

/// One file to optimize on behalf of a folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub folder: PathBuf,
    pub source: PathBuf,
    pub fingerprint: String,
    pub kind: MediaKind,
    pub original_size: u64,
    /// Fail instead of encoding if the folder was unregistered meanwhile.
    pub require_registered: bool,
}

/// Executes jobs on a worker thread. Blocking is expected.
pub trait JobRunner: Send + Sync {
    fn run(&self, job: &Job) -> Result<PathBuf>;
}

/// Produces artifacts through the cache store, encoding only on a miss.
pub struct Optimizer {
    catalog: Arc<Catalog>,
    store: Arc<CacheStore>,
    encoder: Arc<dyn Encoder>,
    max_resolution: u32,
    thumbnail_size: u32,
    quality: u8,
}

impl Optimizer {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<CacheStore>,
        encoder: Arc<dyn Encoder>,
        max_resolution: u32,
        thumbnail_size: u32,
        quality: u8,
    ) -> Self {
        Self {
            catalog,
            store,
            encoder,
            max_resolution,
            thumbnail_size,
            quality,
        }
    }

    /// Cached artifact for `fingerprint`, encoding `source` if needed.
    pub fn artifact(
        &self,
        source: &Path,
        fingerprint: &str,
        media: MediaKind,
        artifact: ArtifactKind,
        original_size: u64,
    ) -> Result<PathBuf> {
        let max_dimension = match artifact {
            ArtifactKind::Thumbnail => self.thumbnail_size,
            ArtifactKind::Optimized => self.max_resolution,
        };
        let (entry, created) =
            self.store
                .get_or_create(fingerprint, artifact, original_size, || {
                    self.encoder.encode(&EncodeRequest {
                        source,
                        media,
                        artifact,
                        max_dimension,
                        quality: self.quality,
                    })
                })?;
        if created {
            tracing::debug!(source = %source.display(), %artifact, "encoded");
        }
        if let Err(e) = self.record_source(source, media) {
            tracing::warn!(source = %source.display(), error = %e, "source not catalogued");
        }
        Ok(entry.artifact_path)
    }

    /// Catalogue a source inside a registered folder that no scan has seen
    /// yet, so orphan cleanup keeps the artifacts made from it.
    fn record_source(&self, source: &Path, media: MediaKind) -> Result<()> {
        if self.catalog.get_media(source)?.is_some() {
            return Ok(());
        }
        let Some(folder) = self.catalog.folder_for_path(source)? else {
            return Ok(());
        };
        let source = source.canonicalize()?;
        self.catalog
            .upsert_media(folder.id, &metadata::describe(&source, media)?)
    }
}

impl JobRunner for Optimizer {
    fn run(&self, job: &Job) -> Result<PathBuf> {
        if job.require_registered && self.catalog.get_folder(&job.folder)?.is_none() {
            return Err(Error::FolderNotRegistered(job.folder.clone()));
        }
        self.artifact(
            &job.source,
            &job.fingerprint,
            job.kind,
            ArtifactKind::Optimized,
            job.original_size,
        )
    }
}
