//! SourceRegistry - source_id -> network URI
//!
//! ## Responsibilities
//!
//! - Load source definitions at boot (JSON file)
//! - Runtime registration (immutable once registered)
//! - Source id validation (ids become directory names)

mod types;

pub use types::*;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// SourceRegistry instance
pub struct SourceRegistry {
    sources: RwLock<HashMap<String, Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Build from an in-memory list
    pub async fn with_sources(sources: Vec<Source>) -> Result<Self> {
        let registry = Self::new();
        for source in sources {
            registry.register(source).await?;
        }
        Ok(registry)
    }

    /// Load `{ "sources": [...] }` from disk. A missing file yields an empty registry.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            tracing::warn!(path = %path.display(), "Sources file not found, starting with empty registry");
            return Ok(Self::new());
        }

        let raw = tokio::fs::read_to_string(path).await?;
        let file: SourcesFile = serde_json::from_str(&raw)?;
        let registry = Self::with_sources(file.sources).await?;

        tracing::info!(
            path = %path.display(),
            count = registry.count().await,
            "Sources loaded"
        );

        Ok(registry)
    }

    /// Register a source.
    ///
    /// Re-registering an identical definition is a no-op; a differing one is a conflict.
    pub async fn register(&self, source: Source) -> Result<Source> {
        validate_source_id(&source.source_id)?;
        if source.uri.trim().is_empty() {
            return Err(Error::Validation(format!(
                "source {} has an empty uri",
                source.source_id
            )));
        }

        let mut sources = self.sources.write().await;
        if let Some(existing) = sources.get(&source.source_id) {
            if *existing == source {
                return Ok(source);
            }
            return Err(Error::Conflict(format!(
                "source {} already registered",
                source.source_id
            )));
        }

        tracing::info!(
            source_id = %source.source_id,
            uri = %redact_credentials(&source.uri),
            "Source registered"
        );
        sources.insert(source.source_id.clone(), source.clone());
        Ok(source)
    }

    pub async fn get(&self, source_id: &str) -> Option<Source> {
        self.sources.read().await.get(source_id).cloned()
    }

    pub async fn list(&self) -> Vec<Source> {
        let mut list: Vec<Source> = self.sources.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        list
    }

    pub async fn count(&self) -> usize {
        self.sources.read().await.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Source ids are used as path components for output files
pub fn validate_source_id(source_id: &str) -> Result<()> {
    let valid = !source_id.is_empty()
        && source_id.len() <= 128
        && source_id != "."
        && source_id != ".."
        && source_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid source_id: {:?}", source_id)))
    }
}
