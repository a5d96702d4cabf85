// SPDX-License-Identifier: MIT OR Apache-2.0

//! External adapter contracts consumed by workflow and saga actions.
//!
//! The core never talks to SMTP, object storage, or gateways itself; it
//! invokes these seams from workflow/saga actions and hooks. Memory
//! implementations back tests and single-node deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use ubl_core::{LedgerError, LedgerResult};

/// Outbound notification channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a message to a recipient entity.
    async fn send(&self, recipient: &str, message: &str) -> LedgerResult<()>;
}

/// In-memory [`Notifier`] that records deliveries.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl MemoryNotifier {
    /// Create an empty notifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All deliveries so far, as `(recipient, message)` pairs.
    #[must_use]
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().expect("notifier log poisoned").clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, recipient: &str, message: &str) -> LedgerResult<()> {
        self.sent
            .lock()
            .expect("notifier log poisoned")
            .push((recipient.to_string(), message.to_string()));
        Ok(())
    }
}

/// Document/attachment storage.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store a document, returning its storage key.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> LedgerResult<String>;
    /// Fetch a document by key.
    async fn download(&self, key: &str) -> LedgerResult<Vec<u8>>;
}

/// In-memory [`DocumentStore`].
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> LedgerResult<String> {
        let key = format!("doc-{}-{name}", ubl_core::new_event_id());
        self.docs
            .lock()
            .expect("document store poisoned")
            .insert(key.clone(), bytes);
        Ok(key)
    }

    async fn download(&self, key: &str) -> LedgerResult<Vec<u8>> {
        self.docs
            .lock()
            .expect("document store poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(format!("document {key}")))
    }
}
