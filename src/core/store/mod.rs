//! Exact-match document cache and analysis history

mod cache;
mod history;

pub use cache::{
    Document, DocumentCache, FileDocumentCache, InMemoryDocumentCache, SourceTag,
};
pub use history::{EntryPointRecord, HistoryRecord, HistoryStore, JsonHistoryStore, ProjectSummary};
