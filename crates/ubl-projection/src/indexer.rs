// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental search indexing with consistency tracking.
//!
//! The indexer is a projection that mirrors entities, assets, and
//! agreements into an external search engine through the [`SearchEngine`]
//! adapter. It keeps a last-indexed sequence, advances it only on
//! successful indexing, and surfaces the gap to the head as
//! `index_lag_events` so clients can see eventual consistency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use ubl_core::{Event, LedgerResult};
use ubl_domain::{event_types, DomainEvent};
use ubl_store::EventStore;

use crate::Projection;

/// A flat document handed to the search engine.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SearchDocument {
    /// Document id, unique per aggregate (`"entity:ent-1"`).
    pub id: String,
    /// Realm the document belongs to, for filtering.
    pub realm_id: Option<String>,
    /// Document kind (`"entity"`, `"asset"`, `"agreement"`).
    pub doc_type: String,
    /// Searchable fields.
    pub fields: BTreeMap<String, serde_json::Value>,
}

/// Cursor over search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Results to skip.
    pub offset: usize,
    /// Maximum results to return.
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Search results with the indexer's consistency marker attached.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResults {
    /// Matching documents.
    pub hits: Vec<SearchDocument>,
    /// Total matches before pagination.
    pub total: usize,
    /// Events appended but not yet indexed.
    pub index_lag_events: u64,
}

/// External search engine adapter.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Insert or replace a document.
    async fn index(&self, doc: SearchDocument) -> LedgerResult<()>;
    /// Remove a document by id.
    async fn delete(&self, id: &str) -> LedgerResult<()>;
    /// Query documents. `filters` match exact field values.
    async fn search(
        &self,
        query: &str,
        filters: &BTreeMap<String, String>,
        page: Pagination,
    ) -> LedgerResult<Vec<SearchDocument>>;
}

/// In-memory [`SearchEngine`] with naive substring matching.
#[derive(Debug, Default)]
pub struct MemorySearchEngine {
    docs: RwLock<BTreeMap<String, SearchDocument>>,
}

impl MemorySearchEngine {
    /// Create an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.docs.read().expect("search index poisoned").len()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SearchEngine for MemorySearchEngine {
    async fn index(&self, doc: SearchDocument) -> LedgerResult<()> {
        self.docs
            .write()
            .expect("search index poisoned")
            .insert(doc.id.clone(), doc);
        Ok(())
    }

    async fn delete(&self, id: &str) -> LedgerResult<()> {
        self.docs.write().expect("search index poisoned").remove(id);
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        filters: &BTreeMap<String, String>,
        page: Pagination,
    ) -> LedgerResult<Vec<SearchDocument>> {
        let query = query.to_lowercase();
        let docs = self.docs.read().expect("search index poisoned");
        let hits: Vec<SearchDocument> = docs
            .values()
            .filter(|doc| {
                let text_match = query.is_empty()
                    || doc.fields.values().any(|v| {
                        v.as_str()
                            .is_some_and(|s| s.to_lowercase().contains(&query))
                    });
                let filter_match = filters.iter().all(|(k, expected)| match k.as_str() {
                    "doc_type" => &doc.doc_type == expected,
                    "realm_id" => doc.realm_id.as_deref() == Some(expected),
                    field => doc
                        .fields
                        .get(field)
                        .and_then(|v| v.as_str())
                        .is_some_and(|s| s == expected),
                });
                text_match && filter_match
            })
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(hits)
    }
}

/// Projection mirroring domain aggregates into the search engine.
pub struct SearchIndexer {
    store: Arc<dyn EventStore>,
    engine: Arc<dyn SearchEngine>,
    last_indexed: AtomicU64,
}

impl SearchIndexer {
    /// Stable projection name.
    pub const NAME: &'static str = "search_indexer";

    /// Wire an indexer over the store and an engine adapter.
    pub fn new(store: Arc<dyn EventStore>, engine: Arc<dyn SearchEngine>) -> Self {
        Self {
            store,
            engine,
            last_indexed: AtomicU64::new(0),
        }
    }

    /// Sequence of the last successfully indexed event.
    #[must_use]
    pub fn last_indexed_sequence(&self) -> u64 {
        self.last_indexed.load(Ordering::Relaxed)
    }

    /// Query the engine, attaching the current consistency marker.
    ///
    /// # Errors
    ///
    /// Propagates engine and store failures.
    pub async fn search(
        &self,
        query: &str,
        filters: &BTreeMap<String, String>,
        page: Pagination,
    ) -> LedgerResult<SearchResults> {
        let hits = self.engine.search(query, filters, page).await?;
        let head = self.store.get_current_sequence().await?;
        Ok(SearchResults {
            total: hits.len(),
            hits,
            index_lag_events: head.saturating_sub(self.last_indexed_sequence()),
        })
    }

    fn document_for(event: &Event, parsed: &DomainEvent) -> Option<SearchDocument> {
        let mut fields = BTreeMap::new();
        match parsed {
            DomainEvent::EntityCreated(p) => {
                fields.insert("name".into(), serde_json::json!(p.identity.name));
                fields.insert("entity_type".into(), serde_json::to_value(p.entity_type).ok()?);
                Some(SearchDocument {
                    id: format!("entity:{}", event.aggregate_id),
                    realm_id: Some(p.realm_id.clone()),
                    doc_type: "entity".into(),
                    fields,
                })
            }
            DomainEvent::AssetCreated(p) => {
                fields.insert("asset_type".into(), serde_json::json!(p.asset_type));
                if let Some(owner) = &p.owner_id {
                    fields.insert("owner_id".into(), serde_json::json!(owner));
                }
                Some(SearchDocument {
                    id: format!("asset:{}", event.aggregate_id),
                    realm_id: Some(p.realm_id.clone()),
                    doc_type: "asset".into(),
                    fields,
                })
            }
            DomainEvent::AgreementProposed(p) => {
                fields.insert("agreement_type".into(), serde_json::json!(p.agreement_type));
                fields.insert(
                    "parties".into(),
                    serde_json::json!(p
                        .parties
                        .iter()
                        .map(|q| q.entity_id.clone())
                        .collect::<Vec<_>>()),
                );
                Some(SearchDocument {
                    id: format!("agreement:{}", event.aggregate_id),
                    realm_id: Some(p.realm_id.clone()),
                    doc_type: "agreement".into(),
                    fields,
                })
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Projection for SearchIndexer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn subscribes_to(&self) -> Vec<String> {
        vec![
            event_types::ENTITY_CREATED.into(),
            event_types::ENTITY_DELETED.into(),
            event_types::ASSET_CREATED.into(),
            event_types::AGREEMENT_PROPOSED.into(),
        ]
    }

    async fn handle(&self, event: &Event) -> LedgerResult<()> {
        let parsed = DomainEvent::parse(event)?;
        if matches!(parsed, DomainEvent::EntityDeleted) {
            self.engine
                .delete(&format!("entity:{}", event.aggregate_id))
                .await?;
        } else if let Some(doc) = Self::document_for(event, &parsed) {
            self.engine.index(doc).await?;
        }
        // The marker only advances after the engine accepted the write.
        self.last_indexed.store(event.sequence, Ordering::Relaxed);
        Ok(())
    }

    async fn reset(&self) -> LedgerResult<()> {
        self.last_indexed.store(0, Ordering::Relaxed);
        Ok(())
    }
}
