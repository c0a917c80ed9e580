//! Batches: a named group of work with an optional configuration document.

use crate::core::{EngineError, Result};
use crate::document::DocumentManager;
use crate::executor::{Command, EngineEvent, ExecutionContext};
use crate::impl_entity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub batch_type: String,
    pub search_key: Option<String>,
    pub document_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub revision: u64,
}

impl_entity!(Batch, "batch");

pub struct CreateBatchCmd {
    pub batch_type: String,
    pub search_key: Option<String>,
    pub configuration: Option<Vec<u8>>,
}

impl CreateBatchCmd {
    pub fn new(batch_type: &str) -> Self {
        Self {
            batch_type: batch_type.to_string(),
            search_key: None,
            configuration: None,
        }
    }

    pub fn search_key(mut self, key: &str) -> Self {
        self.search_key = Some(key.to_string());
        self
    }

    pub fn configuration(mut self, bytes: Vec<u8>) -> Self {
        self.configuration = Some(bytes);
        self
    }
}

#[async_trait]
impl Command for CreateBatchCmd {
    type Output = Batch;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Batch> {
        if self.batch_type.is_empty() {
            return Err(EngineError::IllegalArgument("batch type is empty".into()));
        }

        let document_id = match &self.configuration {
            Some(bytes) => Some(
                ctx.manager::<DocumentManager>()
                    .insert(ctx, "batch-configuration", bytes.clone())?,
            ),
            None => None,
        };

        let mut batch = Batch {
            id: uuid::Uuid::new_v4().to_string(),
            batch_type: self.batch_type.clone(),
            search_key: self.search_key.clone(),
            document_id,
            created_at: ctx.now(),
            revision: 0,
        };
        ctx.insert(&mut batch)?;
        Ok(batch)
    }
}

pub struct FindBatchCmd {
    pub batch_id: String,
}

#[async_trait]
impl Command for FindBatchCmd {
    type Output = Option<Batch>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<Batch>> {
        ctx.find::<Batch>(&self.batch_id).await
    }
}

/// Delete one batch and its configuration document. The batch must exist.
pub struct DeleteBatchCmd {
    pub batch_id: String,
}

impl DeleteBatchCmd {
    pub fn new(batch_id: &str) -> Self {
        Self {
            batch_id: batch_id.to_string(),
        }
    }
}

#[async_trait]
impl Command for DeleteBatchCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if self.batch_id.is_empty() {
            return Err(EngineError::IllegalArgument("batch id is empty".into()));
        }

        let batch = ctx.require::<Batch>(&self.batch_id).await?;
        ctx.manager::<DocumentManager>()
            .delete_if_present(ctx, batch.document_id.as_deref())
            .await?;
        ctx.delete(&batch)?;
        ctx.dispatch_event(EngineEvent::BatchDeleted {
            batch_id: batch.id.clone(),
        });
        Ok(())
    }
}
