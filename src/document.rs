//! Byte payloads attached to jobs and batches.

use crate::core::{EngineError, Result};
use crate::executor::{EngineServices, EntityManager, ExecutionContext};
use crate::impl_entity;
use crate::transaction::Entity;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub bytes: Vec<u8>,
    #[serde(skip)]
    pub revision: u64,
}

impl_entity!(Document, "document");

impl Document {
    pub fn new(name: &str, bytes: Vec<u8>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            bytes,
            revision: 0,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Context-scoped access to documents.
pub struct DocumentManager;

impl EntityManager for DocumentManager {
    fn create(_services: &EngineServices) -> Self {
        DocumentManager
    }
}

impl DocumentManager {
    /// Stage a new document and return its id.
    pub fn insert(&self, ctx: &mut ExecutionContext, name: &str, bytes: Vec<u8>) -> Result<String> {
        let mut document = Document::new(name, bytes);
        ctx.insert(&mut document)?;
        Ok(document.id)
    }

    pub async fn find(&self, ctx: &mut ExecutionContext, id: &str) -> Result<Option<Document>> {
        ctx.find::<Document>(id).await
    }

    /// Delete a document that must exist.
    pub async fn delete(&self, ctx: &mut ExecutionContext, id: &str) -> Result<()> {
        if ctx.delete_by_id::<Document>(id).await? {
            Ok(())
        } else {
            Err(EngineError::not_found(Document::KIND, id))
        }
    }

    /// Delete a document if it is still there; returns whether it was.
    pub async fn delete_if_present(&self, ctx: &mut ExecutionContext, id: Option<&str>) -> Result<bool> {
        match id {
            Some(id) => ctx.delete_by_id::<Document>(id).await,
            None => Ok(false),
        }
    }
}

/// MessagePack encoding of job handler payloads.
pub struct JobPayload;

impl JobPayload {
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
