use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::debug;

use crate::error::{FlowscribeError, Result};

/// Kind of document, used as the lookup tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceTag {
    Parser,
    Code,
    Comments,
    CallTree,
    CodeAnalysis,
    CallTreeSummary,
    SequenceDiagram,
}

impl SourceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTag::Parser => "PARSER",
            SourceTag::Code => "CODE",
            SourceTag::Comments => "COMMENTS",
            SourceTag::CallTree => "CALLTREE",
            SourceTag::CodeAnalysis => "CODE_ANALYSIS",
            SourceTag::CallTreeSummary => "CALLTREE_SUMMARY",
            SourceTag::SequenceDiagram => "SEQUENCE_DIAGRAM",
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub project_id: String,
    pub tag: SourceTag,
    /// Entry point or method FQN for keyed documents
    pub key: Option<String>,
    pub content: Value,
}

impl Document {
    /// Document derived from a parser output file: `project::TAG::stem::hash8`
    pub fn from_file(project_id: &str, tag: SourceTag, path: &Path, content: Value) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        Self {
            id: format!("{}::{}::{}::{}", project_id, tag, stem, &hash[..8]),
            project_id: project_id.to_string(),
            tag,
            key: None,
            content,
        }
    }

    /// Document looked up by key: `project::TAG::key`
    pub fn keyed(project_id: &str, tag: SourceTag, key: &str, content: Value) -> Self {
        Self {
            id: format!("{}::{}::{}", project_id, tag, key),
            project_id: project_id.to_string(),
            tag,
            key: Some(key.to_string()),
            content,
        }
    }

    /// Deserialize the content into a typed record
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.content.clone()).map_err(|e| {
            FlowscribeError::Store(format!("Document {} has unexpected shape: {}", self.id, e))
        })
    }
}

/// Exact-match lookup of documents by project, tag and key.
///
/// `save` upserts by document id.
pub trait DocumentCache: Send + Sync {
    fn save(&self, documents: Vec<Document>) -> Result<usize>;

    fn load_all_by_tag(&self, project_id: &str, tag: SourceTag) -> Result<Vec<Document>>;

    fn load_one_by_tag_and_key(
        &self,
        project_id: &str,
        tag: SourceTag,
        key: &str,
    ) -> Result<Option<Document>>;

    /// Remove every document of a project; returns how many were dropped
    fn clear_project(&self, project_id: &str) -> Result<usize>;
}

fn upsert(existing: &mut Vec<Document>, documents: Vec<Document>) -> usize {
    let mut slots: HashMap<String, usize> = existing
        .iter()
        .enumerate()
        .map(|(i, d)| (d.id.clone(), i))
        .collect();
    let mut count = 0;
    for doc in documents {
        match slots.get(&doc.id) {
            Some(&i) => existing[i] = doc,
            None => {
                slots.insert(doc.id.clone(), existing.len());
                existing.push(doc);
            }
        }
        count += 1;
    }
    count
}

fn group_by_project(documents: Vec<Document>) -> HashMap<String, Vec<Document>> {
    let mut by_project: HashMap<String, Vec<Document>> = HashMap::new();
    for doc in documents {
        by_project.entry(doc.project_id.clone()).or_default().push(doc);
    }
    by_project
}

fn find_keyed(docs: &[Document], tag: SourceTag, key: &str) -> Option<Document> {
    docs.iter()
        .find(|d| d.tag == tag && d.key.as_deref() == Some(key))
        .cloned()
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentCache {
    projects: RwLock<HashMap<String, Vec<Document>>>,
}

impl InMemoryDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_err<E: fmt::Display>(e: E) -> FlowscribeError {
    FlowscribeError::Store(format!("Cache lock poisoned: {}", e))
}

impl DocumentCache for InMemoryDocumentCache {
    fn save(&self, documents: Vec<Document>) -> Result<usize> {
        let mut projects = self.projects.write().map_err(lock_err)?;
        let mut count = 0;
        for (project_id, docs) in group_by_project(documents) {
            count += upsert(projects.entry(project_id).or_default(), docs);
        }
        Ok(count)
    }

    fn load_all_by_tag(&self, project_id: &str, tag: SourceTag) -> Result<Vec<Document>> {
        let projects = self.projects.read().map_err(lock_err)?;
        Ok(projects
            .get(project_id)
            .map(|docs| docs.iter().filter(|d| d.tag == tag).cloned().collect())
            .unwrap_or_default())
    }

    fn load_one_by_tag_and_key(
        &self,
        project_id: &str,
        tag: SourceTag,
        key: &str,
    ) -> Result<Option<Document>> {
        let projects = self.projects.read().map_err(lock_err)?;
        Ok(projects
            .get(project_id)
            .and_then(|docs| find_keyed(docs, tag, key)))
    }

    fn clear_project(&self, project_id: &str) -> Result<usize> {
        let mut projects = self.projects.write().map_err(lock_err)?;
        Ok(projects.remove(project_id).map(|docs| docs.len()).unwrap_or(0))
    }
}

/// One JSON file per project under a cache directory
#[derive(Debug)]
pub struct FileDocumentCache {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileDocumentCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// `<sha256 of project id>.json`
    fn project_file(&self, project_id: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(project_id.as_bytes());
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    fn read_project(&self, project_id: &str) -> Result<Vec<Document>> {
        let path = self.project_file(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)?;
        let docs: Vec<Document> = serde_json::from_str(&content)?;
        Ok(docs.into_iter().filter(|d| d.project_id == project_id).collect())
    }

    fn write_project(&self, project_id: &str, docs: &[Document]) -> Result<()> {
        let path = self.project_file(project_id);
        std::fs::write(&path, serde_json::to_string_pretty(docs)?)?;
        debug!("Wrote {} documents to {}", docs.len(), path.display());
        Ok(())
    }
}

impl DocumentCache for FileDocumentCache {
    fn save(&self, documents: Vec<Document>) -> Result<usize> {
        let _guard = self.write_lock.lock().map_err(lock_err)?;

        let mut count = 0;
        for (project_id, docs) in group_by_project(documents) {
            let mut existing = self.read_project(&project_id)?;
            count += upsert(&mut existing, docs);
            self.write_project(&project_id, &existing)?;
        }
        Ok(count)
    }

    fn load_all_by_tag(&self, project_id: &str, tag: SourceTag) -> Result<Vec<Document>> {
        Ok(self
            .read_project(project_id)?
            .into_iter()
            .filter(|d| d.tag == tag)
            .collect())
    }

    fn load_one_by_tag_and_key(
        &self,
        project_id: &str,
        tag: SourceTag,
        key: &str,
    ) -> Result<Option<Document>> {
        Ok(find_keyed(&self.read_project(project_id)?, tag, key))
    }

    fn clear_project(&self, project_id: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().map_err(lock_err)?;
        let count = self.read_project(project_id)?.len();
        let path = self.project_file(project_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(cache: &dyn DocumentCache) {
        let docs = vec![
            Document::keyed("p1", SourceTag::CallTree, "a.B.c()", json!({"depth": 2})),
            Document::keyed("p1", SourceTag::CodeAnalysis, "a.B.c()", json!({"summary": "x"})),
            Document::keyed("p2", SourceTag::CallTree, "a.B.c()", json!({"depth": 5})),
        ];
        assert_eq!(cache.save(docs).unwrap(), 3);

        let found = cache
            .load_one_by_tag_and_key("p1", SourceTag::CallTree, "a.B.c()")
            .unwrap()
            .unwrap();
        assert_eq!(found.content["depth"], 2);
        assert!(cache
            .load_one_by_tag_and_key("p1", SourceTag::CallTree, "a.B.d()")
            .unwrap()
            .is_none());

        // same id replaces
        cache
            .save(vec![Document::keyed("p1", SourceTag::CallTree, "a.B.c()", json!({"depth": 3}))])
            .unwrap();
        let all = cache.load_all_by_tag("p1", SourceTag::CallTree).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content["depth"], 3);

        assert_eq!(cache.clear_project("p1").unwrap(), 2);
        assert!(cache.load_all_by_tag("p1", SourceTag::CallTree).unwrap().is_empty());
        assert_eq!(cache.load_all_by_tag("p2", SourceTag::CallTree).unwrap().len(), 1);
    }

    #[test]
    fn test_in_memory_cache() {
        exercise(&InMemoryDocumentCache::new());
    }

    #[test]
    fn test_file_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileDocumentCache::new(dir.path()).unwrap();
        exercise(&cache);
    }

    #[test]
    fn test_file_cache_keeps_similar_project_ids_apart() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileDocumentCache::new(dir.path()).unwrap();
        cache
            .save(vec![
                Document::keyed("a.b", SourceTag::CallTree, "E", json!({"owner": "dotted"})),
                Document::keyed("a_b", SourceTag::CallTree, "E", json!({"owner": "underscored"})),
            ])
            .unwrap();

        let dotted = cache.load_all_by_tag("a.b", SourceTag::CallTree).unwrap();
        assert_eq!(dotted.len(), 1);
        assert_eq!(dotted[0].content["owner"], "dotted");

        assert_eq!(cache.clear_project("a_b").unwrap(), 1);
        assert!(cache.load_all_by_tag("a_b", SourceTag::CallTree).unwrap().is_empty());
        assert!(cache
            .load_one_by_tag_and_key("a.b", SourceTag::CallTree, "E")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut docs = vec![
            Document::keyed("p1", SourceTag::CallTree, "A", json!(1)),
            Document::keyed("p1", SourceTag::CallTree, "B", json!(2)),
        ];
        let saved = upsert(
            &mut docs,
            vec![
                Document::keyed("p1", SourceTag::CallTree, "B", json!(3)),
                Document::keyed("p1", SourceTag::CallTree, "C", json!(4)),
                Document::keyed("p1", SourceTag::CallTree, "C", json!(5)),
            ],
        );

        assert_eq!(saved, 3);
        let values: Vec<i64> = docs.iter().map(|d| d.content.as_i64().unwrap()).collect();
        assert_eq!(values, vec![1, 3, 5]);
    }

    #[test]
    fn test_file_document_id() {
        let doc = Document::from_file(
            "p1",
            SourceTag::Parser,
            Path::new("/out/UserController_call_tree.json"),
            json!({}),
        );
        let parts: Vec<&str> = doc.id.split("::").collect();
        assert_eq!(parts[0], "p1");
        assert_eq!(parts[1], "PARSER");
        assert_eq!(parts[2], "UserController_call_tree");
        assert_eq!(parts[3].len(), 8);
        assert!(doc.key.is_none());
    }
}
