use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use crate::model::{Document, Source};

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// All sources, ordered by id.
    async fn list_sources(&self) -> anyhow::Result<Vec<Source>>;
    async fn get_source(&self, source_id: &str) -> anyhow::Result<Option<Source>>;
    async fn save_source(&self, source: &Source) -> anyhow::Result<()>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Documents of one source, ordered by id.
    async fn list_documents(&self, source_id: &str) -> anyhow::Result<Vec<Document>>;
    async fn get_document(
        &self,
        source_id: &str,
        document_id: &str,
    ) -> anyhow::Result<Option<Document>>;
    /// Stores `document` unless one with the same id exists. Returns whether it was written.
    async fn insert_if_absent(&self, document: &Document) -> anyhow::Result<bool>;
    async fn put_document(&self, document: &Document) -> anyhow::Result<()>;

    async fn canonical_urls(&self, source_id: &str) -> anyhow::Result<HashSet<String>> {
        Ok(self
            .list_documents(source_id)
            .await?
            .into_iter()
            .map(|doc| doc.canonical_url)
            .collect())
    }

    /// Push timestamps of the source at or after `since`.
    async fn push_times_since(
        &self,
        source_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Vec<DateTime<Utc>>> {
        Ok(self
            .list_documents(source_id)
            .await?
            .into_iter()
            .filter_map(|doc| doc.pushed_at)
            .filter(|at| *at >= since)
            .collect())
    }

    /// Documents whose earlier delivery failed and may be tried again.
    async fn retry_candidates(
        &self,
        source_id: &str,
        max_attempts: u32,
    ) -> anyhow::Result<Vec<Document>> {
        Ok(self
            .list_documents(source_id)
            .await?
            .into_iter()
            .filter(|doc| doc.awaits_push(max_attempts))
            .collect())
    }
}

pub trait Store: SourceStore + DocumentStore {}

impl<T: SourceStore + DocumentStore> Store for T {}

/// JSON files under a data directory.
#[derive(Debug, Clone)]
pub struct LocalFsStore {
    base_dir: PathBuf,
}

impl LocalFsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn sources_dir(&self) -> PathBuf {
        self.base_dir.join("sources")
    }

    fn source_path(&self, source_id: &str) -> PathBuf {
        self.sources_dir().join(format!("{source_id}.json"))
    }

    fn documents_dir(&self, source_id: &str) -> PathBuf {
        self.base_dir.join("documents").join(source_id)
    }

    fn document_path(&self, source_id: &str, document_id: &str) -> PathBuf {
        self.documents_dir(source_id)
            .join(format!("{document_id}.json"))
    }
}

#[async_trait]
impl SourceStore for LocalFsStore {
    async fn list_sources(&self) -> anyhow::Result<Vec<Source>> {
        let dir = self.sources_dir();
        read_json_dir(&dir)
            .await
            .with_context(|| format!("list sources: {}", dir.display()))
    }

    async fn get_source(&self, source_id: &str) -> anyhow::Result<Option<Source>> {
        let path = self.source_path(source_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn save_source(&self, source: &Source) -> anyhow::Result<()> {
        write_json_atomic(&self.source_path(&source.id), source)
            .await
            .with_context(|| format!("write source {}", source.id))
    }
}

#[async_trait]
impl DocumentStore for LocalFsStore {
    async fn list_documents(&self, source_id: &str) -> anyhow::Result<Vec<Document>> {
        let dir = self.documents_dir(source_id);
        read_json_dir(&dir)
            .await
            .with_context(|| format!("list documents: {}", dir.display()))
    }

    async fn get_document(
        &self,
        source_id: &str,
        document_id: &str,
    ) -> anyhow::Result<Option<Document>> {
        let path = self.document_path(source_id, document_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn insert_if_absent(&self, document: &Document) -> anyhow::Result<bool> {
        let path = self.document_path(&document.source_id, &document.id);
        if fs::try_exists(&path)
            .await
            .with_context(|| format!("stat: {}", path.display()))?
        {
            return Ok(false);
        }
        write_json_atomic(&path, document)
            .await
            .with_context(|| format!("write document {}", document.id))?;
        Ok(true)
    }

    async fn put_document(&self, document: &Document) -> anyhow::Result<()> {
        write_json_atomic(
            &self.document_path(&document.source_id, &document.id),
            document,
        )
        .await
        .with_context(|| format!("write document {}", document.id))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

/// Every `*.json` file of `dir`, sorted by file name. A missing directory is empty.
async fn read_json_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await.context("read dir entry")? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut values = Vec::with_capacity(paths.len());
    for path in paths {
        if let Some(value) = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
        {
            values.push(value);
        }
    }
    Ok(values)
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

/// Keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sources: Mutex<BTreeMap<String, Source>>,
    documents: Mutex<BTreeMap<(String, String), Document>>,
}

#[async_trait]
impl SourceStore for MemoryStore {
    async fn list_sources(&self) -> anyhow::Result<Vec<Source>> {
        let sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sources.values().cloned().collect())
    }

    async fn get_source(&self, source_id: &str) -> anyhow::Result<Option<Source>> {
        let sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sources.get(source_id).cloned())
    }

    async fn save_source(&self, source: &Source) -> anyhow::Result<()> {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.insert(source.id.clone(), source.clone());
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_documents(&self, source_id: &str) -> anyhow::Result<Vec<Document>> {
        let documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(documents
            .iter()
            .filter(|((sid, _), _)| sid == source_id)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn get_document(
        &self,
        source_id: &str,
        document_id: &str,
    ) -> anyhow::Result<Option<Document>> {
        let documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(documents
            .get(&(source_id.to_owned(), document_id.to_owned()))
            .cloned())
    }

    async fn insert_if_absent(&self, document: &Document) -> anyhow::Result<bool> {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (document.source_id.clone(), document.id.clone());
        if documents.contains_key(&key) {
            return Ok(false);
        }
        documents.insert(key, document.clone());
        Ok(true)
    }

    async fn put_document(&self, document: &Document) -> anyhow::Result<()> {
        let mut documents = self.documents.lock().unwrap_or_else(PoisonError::into_inner);
        documents.insert(
            (document.source_id.clone(), document.id.clone()),
            document.clone(),
        );
        Ok(())
    }
}
