//! Handler registry for dispatching jobs by kind.
//!
//! The registry maps each [`JobKind`] to a handler so the worker pool can
//! execute claimed jobs without knowing the concrete domain logic. Domains
//! register their handlers at startup in the composition root.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::job::{Job, JobKind};
use crate::error::{JobError, JobResult};

/// A job handler maps a job to a result map or a classified error.
///
/// Handlers run under a per-job deadline and must tolerate redelivery
/// (at-least-once semantics): storage writes have to be idempotent. A
/// handler must never call back into the queue for the job it is
/// processing.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> JobResult<Map<String, Value>>;
}

/// Type alias for the boxed async handler function.
type BoxedHandler = Box<
    dyn Fn(Job) -> Pin<Box<dyn Future<Output = JobResult<Map<String, Value>>> + Send>>
        + Send
        + Sync,
>;

/// Adapter so plain async closures can serve as handlers.
pub struct FnHandler {
    f: BoxedHandler,
}

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<Map<String, Value>>> + Send + 'static,
    {
        Self {
            f: Box::new(move |job| Box::pin(f(job))),
        }
    }
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn handle(&self, job: &Job) -> JobResult<Map<String, Value>> {
        (self.f)(job.clone()).await
    }
}

/// Registry that maps job kinds to handlers.
///
/// Implements [`JobHandler`] itself, so a whole registry can be handed to
/// the worker pool as the single dispatch point.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Register an async closure for a kind.
    pub fn register_fn<F, Fut>(&mut self, kind: JobKind, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobResult<Map<String, Value>>> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler::new(f)));
    }

    pub fn is_registered(&self, kind: JobKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn registered_kinds(&self) -> Vec<JobKind> {
        self.handlers.keys().copied().collect()
    }
}

#[async_trait]
impl JobHandler for HandlerRegistry {
    async fn handle(&self, job: &Job) -> JobResult<Map<String, Value>> {
        let handler = self
            .handlers
            .get(&job.kind)
            .ok_or_else(|| JobError::Validation(format!("no handler for kind: {}", job.kind)))?;
        handler.handle(job).await
    }
}
