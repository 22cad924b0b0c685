//! Reference `ingest` pipeline: validate → store → notify
//!
//! | phase      | requires                                  | produces                  |
//! |------------|-------------------------------------------|---------------------------|
//! | `validate` | `document`                                | `document_id`, `checksum` |
//! | `store`    | `document`, `document_id`, `checksum`     | `stored_id`, `version`    |
//! | `notify`   | `stored_id`                               | `notified`                |
//!
//! `notify` is optional: a failed notification leaves the document stored.

use crate::event_bus::{BusEvent, EventBus, EventKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use waypoint_core::recorder::input_hash;
use waypoint_core::{CorrelationContext, Payload, Phase, PhaseError, PhaseHandler, PhaseOutput};

pub const INGEST_OPERATION: &str = "ingest";
pub const VALIDATE_PHASE: &str = "validate";
pub const STORE_PHASE: &str = "store";
pub const NOTIFY_PHASE: &str = "notify";

/// Input accepted by `validate`, carried under the `document` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub stored_id: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub checksum: String,
    pub version: u64,
    pub document: Document,
    pub stored_at: DateTime<Utc>,
}

/// Versioned in-memory document store keyed by tenant and document id.
#[derive(Default)]
pub struct DocumentStore {
    documents: Mutex<HashMap<String, StoredDocument>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stored_id: &str) -> Option<StoredDocument> {
        self.documents.lock().ok()?.get(stored_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.documents.lock().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Same content stored twice keeps its version.
    fn put(
        &self,
        ctx: &CorrelationContext,
        document: Document,
        checksum: String,
    ) -> Result<StoredDocument, PhaseError> {
        let stored_id = format!(
            "{}/{}",
            ctx.tenant_id.as_deref().unwrap_or("default"),
            document.id
        );
        let mut documents = self
            .documents
            .lock()
            .map_err(|_| PhaseError::Execution("document store poisoned".to_string()))?;

        let version = match documents.get(&stored_id) {
            Some(existing) if existing.checksum == checksum => existing.version,
            Some(existing) => existing.version + 1,
            None => 1,
        };
        let stored = StoredDocument {
            stored_id: stored_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            tenant_id: ctx.tenant_id.clone(),
            checksum,
            version,
            document,
            stored_at: Utc::now(),
        };
        documents.insert(stored_id, stored.clone());
        Ok(stored)
    }
}

fn document_from(input: &Payload) -> Result<Document, PhaseError> {
    let raw = input
        .get("document")
        .cloned()
        .ok_or_else(|| PhaseError::InvalidInput("document missing".to_string()))?;
    serde_json::from_value(raw).map_err(|e| PhaseError::InvalidInput(e.to_string()))
}

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

pub struct ValidateDocument {
    max_body_bytes: usize,
}

impl Default for ValidateDocument {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl ValidateDocument {
    pub fn with_max_body_bytes(max_body_bytes: usize) -> Self {
        Self { max_body_bytes }
    }
}

#[async_trait]
impl PhaseHandler for ValidateDocument {
    async fn handle(&self, _ctx: CorrelationContext, input: Payload) -> Result<PhaseOutput, PhaseError> {
        let document = match document_from(&input) {
            Ok(document) => document,
            Err(e) => return Ok(PhaseOutput::failed(e.to_string())),
        };
        if document.id.trim().is_empty() {
            return Ok(PhaseOutput::failed("document id is empty"));
        }
        if document.body.is_empty() {
            return Ok(PhaseOutput::failed(format!("document {} has no body", document.id)));
        }
        if document.body.len() > self.max_body_bytes {
            return Ok(PhaseOutput::failed(format!(
                "document {} is {} bytes, limit {}",
                document.id,
                document.body.len(),
                self.max_body_bytes
            )));
        }

        Ok(PhaseOutput::ok(payload(json!({
            "document_id": document.id,
            "checksum": input_hash(&Value::String(document.body)),
        }))))
    }
}

pub struct StoreDocument {
    store: Arc<DocumentStore>,
}

impl StoreDocument {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PhaseHandler for StoreDocument {
    async fn handle(&self, ctx: CorrelationContext, input: Payload) -> Result<PhaseOutput, PhaseError> {
        let document = document_from(&input)?;
        let checksum = input
            .get("checksum")
            .and_then(Value::as_str)
            .ok_or_else(|| PhaseError::InvalidInput("checksum is not a string".to_string()))?
            .to_string();

        let stored = self.store.put(&ctx, document, checksum)?;
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            stored_id = %stored.stored_id,
            version = stored.version,
            "document stored"
        );
        Ok(PhaseOutput::ok(payload(json!({
            "stored_id": stored.stored_id,
            "version": stored.version,
        }))))
    }
}

pub struct NotifyStored {
    bus: Arc<EventBus>,
}

impl NotifyStored {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PhaseHandler for NotifyStored {
    async fn handle(&self, ctx: CorrelationContext, input: Payload) -> Result<PhaseOutput, PhaseError> {
        let stored_id = input.get("stored_id").cloned().unwrap_or(Value::Null);
        let event = BusEvent::new(EventKind::DocumentStored, &ctx)
            .operation(INGEST_OPERATION)
            .payload(json!({
                "stored_id": stored_id,
                "version": input.get("version").cloned().unwrap_or(Value::Null),
            }));
        let receivers = self.bus.publish(event);
        Ok(PhaseOutput::ok(payload(json!({ "notified": receivers }))))
    }
}

/// The three ingest phases with their handoff contracts, in run order.
pub fn ingest_phases(store: Arc<DocumentStore>, bus: Arc<EventBus>) -> Vec<Phase> {
    vec![
        Phase::new(VALIDATE_PHASE, Arc::new(ValidateDocument::default()))
            .requires(["document"])
            .produces(["document_id", "checksum"]),
        Phase::new(STORE_PHASE, Arc::new(StoreDocument::new(store)))
            .requires(["document", "document_id", "checksum"])
            .produces(["stored_id", "version"]),
        Phase::new(NOTIFY_PHASE, Arc::new(NotifyStored::new(bus)))
            .requires(["stored_id"])
            .produces(["notified"])
            .optional(),
    ]
}

/// Initial pipeline input for one document.
pub fn ingest_input(document: &Document) -> Payload {
    let mut input = Payload::new();
    input.insert(
        "document".to_string(),
        serde_json::to_value(document).unwrap_or(Value::Null),
    );
    input
}
