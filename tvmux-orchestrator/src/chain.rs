//! Failover chain resolution
//!
//! A chain is the requested source followed by its configured failovers, in
//! configured priority order. Resolution is read-only; the catalog that knows
//! about sources and playlists is an external collaborator behind
//! [`SourceCatalog`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{QuotaOwner, SessionKey, Source, SourceId, StreamType};

/// Ordered candidates for one play request plus the current position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceChain {
    key: SessionKey,
    sources: Vec<Source>,
    current_index: usize,
}

impl SourceChain {
    #[must_use]
    pub const fn new(key: SessionKey, sources: Vec<Source>) -> Self {
        Self {
            key,
            sources,
            current_index: 0,
        }
    }

    #[must_use]
    pub const fn key(&self) -> SessionKey {
        self.key
    }

    #[must_use]
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Source> {
        self.sources.get(index)
    }

    #[must_use]
    pub const fn current_index(&self) -> usize {
        self.current_index
    }

    #[must_use]
    pub fn current(&self) -> Option<&Source> {
        self.sources.get(self.current_index)
    }

    /// The originally requested source (index 0).
    #[must_use]
    pub fn original(&self) -> Option<&Source> {
        self.sources.first()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<SourceId> {
        self.sources.iter().map(|s| s.id).collect()
    }

    /// Copy of this chain positioned at `index`.
    #[must_use]
    pub fn at(&self, index: usize) -> Self {
        Self {
            key: self.key,
            sources: self.sources.clone(),
            current_index: index,
        }
    }
}

/// Lookup of sources and their failover lists.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn source(&self, stream_type: StreamType, id: SourceId) -> OrchestratorResult<Option<Source>>;

    /// Failover ids in configured priority order
    async fn failover_ids(&self, stream_type: StreamType, id: SourceId) -> OrchestratorResult<Vec<SourceId>>;
}

#[async_trait]
pub trait SourceChainResolver: Send + Sync {
    async fn resolve(&self, key: SessionKey) -> OrchestratorResult<SourceChain>;
}

/// Builds chains from a [`SourceCatalog`].
pub struct CatalogChainResolver<C> {
    catalog: C,
}

impl<C: SourceCatalog> CatalogChainResolver<C> {
    pub const fn new(catalog: C) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl<C: SourceCatalog> SourceChainResolver for CatalogChainResolver<C> {
    async fn resolve(&self, key: SessionKey) -> OrchestratorResult<SourceChain> {
        let primary = self
            .catalog
            .source(key.stream_type, key.model_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("source {key}")))?;

        let mut seen = HashSet::from([primary.id]);
        let mut sources = vec![primary];

        for id in self.catalog.failover_ids(key.stream_type, key.model_id).await? {
            if !seen.insert(id) {
                continue;
            }
            match self.catalog.source(key.stream_type, id).await? {
                Some(source) => sources.push(source),
                None => warn!(%key, failover_id = id, "Configured failover source does not exist, skipping"),
            }
        }

        Ok(SourceChain::new(key, sources))
    }
}

#[async_trait]
impl<C: SourceCatalog + ?Sized> SourceCatalog for std::sync::Arc<C> {
    async fn source(&self, stream_type: StreamType, id: SourceId) -> OrchestratorResult<Option<Source>> {
        (**self).source(stream_type, id).await
    }

    async fn failover_ids(&self, stream_type: StreamType, id: SourceId) -> OrchestratorResult<Vec<SourceId>> {
        (**self).failover_ids(stream_type, id).await
    }
}

/// Catalog file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub owners: Vec<QuotaOwner>,
    #[serde(default)]
    pub sources: Vec<CatalogSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSource {
    pub id: SourceId,
    pub stream_type: StreamType,
    pub title: String,
    pub url: String,
    pub owner_id: u64,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub failovers: Vec<SourceId>,
}

/// In-memory catalog, loaded from a JSON file in single-node deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    sources: HashMap<(StreamType, SourceId), Source>,
    failovers: HashMap<(StreamType, SourceId), Vec<SourceId>>,
}

impl StaticCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source with its failover ids (builder style).
    #[must_use]
    pub fn with_source(mut self, source: Source, failovers: Vec<SourceId>) -> Self {
        let key = (source.stream_type, source.id);
        self.sources.insert(key, source);
        self.failovers.insert(key, failovers);
        self
    }

    pub fn from_file_contents(file: CatalogFile) -> OrchestratorResult<Self> {
        let owners: HashMap<u64, QuotaOwner> = file.owners.into_iter().map(|o| (o.id, o)).collect();
        let mut catalog = Self::new();

        for entry in file.sources {
            let owner = *owners.get(&entry.owner_id).ok_or_else(|| {
                OrchestratorError::NotFound(format!(
                    "owner {} referenced by source {}",
                    entry.owner_id, entry.id
                ))
            })?;
            let source = Source {
                id: entry.id,
                stream_type: entry.stream_type,
                title: entry.title,
                url: entry.url,
                owner,
                user_agent: entry.user_agent,
            };
            catalog = catalog.with_source(source, entry.failovers);
        }

        Ok(catalog)
    }

    pub async fn load(path: impl AsRef<Path>) -> OrchestratorResult<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await.map_err(|e| {
            OrchestratorError::NotFound(format!("catalog {}: {e}", path.as_ref().display()))
        })?;
        Self::from_file_contents(serde_json::from_str(&raw)?)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn source(&self, stream_type: StreamType, id: SourceId) -> OrchestratorResult<Option<Source>> {
        Ok(self.sources.get(&(stream_type, id)).cloned())
    }

    async fn failover_ids(&self, stream_type: StreamType, id: SourceId) -> OrchestratorResult<Vec<SourceId>> {
        Ok(self.failovers.get(&(stream_type, id)).cloned().unwrap_or_default())
    }
}
