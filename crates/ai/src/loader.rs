//! Lazy, shared, fallback-capable model loading.
//!
//! A [`ModelLoader`] owns one load sequence at a time: the primary identifier
//! is tried first, and only when it fails is the fallback tried. Every caller
//! that asks for the model while a sequence is in flight awaits the same
//! shared future, so a backend is never instantiated twice concurrently.
//! When both identifiers fail nothing is retained and the next
//! [`ModelLoader::acquire`] starts over from the primary.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use strum_macros::AsRefStr;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoadStatus {
    Unloaded,
    Loading,
    Ready,
    /// Both identifiers failed. Nothing is held or in flight, so this behaves
    /// like `Unloaded` except that the last error is kept for readiness queries.
    Failed,
}

/// A backend handle together with the identifier that actually produced it.
#[derive(Debug, Clone)]
pub struct LoadedModel<H> {
    pub identifier: String,
    pub handle: H,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LoadError {
    #[error("failed to load model `{identifier}`: {cause}")]
    Exhausted {
        identifier: String,
        cause: String,
        /// set when a distinct primary was tried before `identifier`
        primary_failure: Option<(String, String)>,
    },
    #[error("model loading aborted: {0}")]
    Aborted(String),
}

/// Passive view of the loader, never triggers a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoaderSnapshot {
    pub status: LoadStatus,
    pub active_identifier: Option<String>,
    pub last_error: Option<String>,
}

impl LoaderSnapshot {
    pub fn is_ready(&self) -> bool {
        self.status == LoadStatus::Ready
    }
}

/// Outcome of a single instantiation attempt.
enum LoadAttempt<H> {
    Loaded(LoadedModel<H>),
    Failed { identifier: String, cause: String },
}

type CreateModelFn<H> = Box<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<H>> + Send + Sync>;
type PendingLoad<H> = Shared<BoxFuture<'static, Result<LoadedModel<H>, LoadError>>>;

struct LoaderState<H> {
    status: LoadStatus,
    active: Option<LoadedModel<H>>,
    pending: Option<PendingLoad<H>>,
    /// bumped on every new sequence and on reset, stale sequences never commit
    generation: u64,
    last_error: Option<String>,
}

struct LoaderInner<H> {
    primary: String,
    fallback: String,
    create_model_fn: CreateModelFn<H>,
    state: Mutex<LoaderState<H>>,
}

pub struct ModelLoader<H> {
    inner: Arc<LoaderInner<H>>,
}

impl<H> Clone for ModelLoader<H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<H> std::fmt::Debug for ModelLoader<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLoader")
            .field("primary", &self.inner.primary)
            .field("fallback", &self.inner.fallback)
            .finish()
    }
}

impl<H> ModelLoader<H>
where
    H: Clone + Send + Sync + 'static,
{
    pub fn new<TFut, TFn>(
        primary: impl Into<String>,
        fallback: impl Into<String>,
        create_model: TFn,
    ) -> Self
    where
        TFut: Future<Output = anyhow::Result<H>> + Send + 'static,
        TFn: Fn(String) -> TFut + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(LoaderInner {
                primary: primary.into(),
                fallback: fallback.into(),
                create_model_fn: Box::new(move |identifier| create_model(identifier).boxed()),
                state: Mutex::new(LoaderState {
                    status: LoadStatus::Unloaded,
                    active: None,
                    pending: None,
                    generation: 0,
                    last_error: None,
                }),
            }),
        }
    }

    pub fn primary_identifier(&self) -> &str {
        &self.inner.primary
    }

    /// Return the ready model, join the in-flight load, or start a new one.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn acquire(&self) -> Result<LoadedModel<H>, LoadError> {
        let pending = {
            let mut state = self.inner.lock_state();
            if let Some(active) = &state.active {
                return Ok(active.clone());
            }
            match state.pending.clone() {
                Some(pending) => pending,
                None => self.start_sequence(&mut state),
            }
        };

        pending.await
    }

    pub fn snapshot(&self) -> LoaderSnapshot {
        let state = self.inner.lock_state();
        LoaderSnapshot {
            status: state.status,
            active_identifier: state.active.as_ref().map(|m| m.identifier.clone()),
            last_error: state.last_error.clone(),
        }
    }

    /// Kick off loading without waiting for it. Failures are only logged;
    /// they stay observable through [`ModelLoader::snapshot`].
    pub fn warmup_in_background(&self) {
        let loader = self.clone();
        tokio::spawn(async move {
            match loader.acquire().await {
                Ok(model) => info!(model_id = %model.identifier, "warmup finished"),
                Err(e) => warn!("warmup failed: {}", e),
            }
        });
    }

    /// Drop the active backend and forget any in-flight sequence.
    pub fn reset(&self) {
        let mut state = self.inner.lock_state();
        state.generation += 1;
        state.status = LoadStatus::Unloaded;
        state.active = None;
        state.pending = None;
        state.last_error = None;
        info!("model loader reset");
    }

    // Check-and-register happens under one lock, the caller still holds it.
    fn start_sequence(&self, state: &mut LoaderState<H>) -> PendingLoad<H> {
        state.generation += 1;
        state.status = LoadStatus::Loading;
        state.last_error = None;
        let generation = state.generation;

        // The sequence runs as its own task so it keeps going when every
        // waiter has been cancelled.
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let outcome = inner.load_sequence().await;
            inner.settle(generation, &outcome);
            outcome
        });

        let inner = self.inner.clone();
        let pending = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let outcome = Err(LoadError::Aborted(e.to_string()));
                    inner.settle(generation, &outcome);
                    outcome
                }
            }
        }
        .boxed()
        .shared();

        state.pending = Some(pending.clone());
        pending
    }
}

impl<H> LoaderInner<H>
where
    H: Clone + Send + Sync + 'static,
{
    fn lock_state(&self) -> MutexGuard<'_, LoaderState<H>> {
        // state stays consistent between statements, a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn attempt(&self, identifier: &str) -> LoadAttempt<H> {
        info!(model_id = %identifier, "loading model");
        match (self.create_model_fn)(identifier.to_string()).await {
            Ok(handle) => LoadAttempt::Loaded(LoadedModel {
                identifier: identifier.to_string(),
                handle,
            }),
            Err(e) => LoadAttempt::Failed {
                identifier: identifier.to_string(),
                cause: format!("{:#}", e),
            },
        }
    }

    async fn try_primary(&self) -> LoadAttempt<H> {
        self.attempt(&self.primary).await
    }

    async fn try_fallback(&self) -> LoadAttempt<H> {
        self.attempt(&self.fallback).await
    }

    async fn load_sequence(&self) -> Result<LoadedModel<H>, LoadError> {
        let (primary, primary_cause) = match self.try_primary().await {
            LoadAttempt::Loaded(model) => return Ok(model),
            LoadAttempt::Failed { identifier, cause } => (identifier, cause),
        };

        if self.fallback == self.primary {
            error!(model_id = %primary, "failed to load model, no distinct fallback: {}", primary_cause);
            return Err(LoadError::Exhausted {
                identifier: primary,
                cause: primary_cause,
                primary_failure: None,
            });
        }

        warn!(
            model_id = %primary,
            fallback = %self.fallback,
            "failed to load primary model, trying fallback: {}",
            primary_cause
        );

        match self.try_fallback().await {
            LoadAttempt::Loaded(model) => Ok(model),
            LoadAttempt::Failed { identifier, cause } => {
                error!(model_id = %identifier, "failed to load fallback model: {}", cause);
                Err(LoadError::Exhausted {
                    identifier,
                    cause,
                    primary_failure: Some((primary, primary_cause)),
                })
            }
        }
    }

    fn settle(&self, generation: u64, outcome: &Result<LoadedModel<H>, LoadError>) {
        let mut state = self.lock_state();
        if state.generation != generation || state.status != LoadStatus::Loading {
            // reset() ran meanwhile, or this sequence was already settled
            return;
        }

        state.pending = None;
        match outcome {
            Ok(model) => {
                info!(model_id = %model.identifier, "model ready");
                state.status = LoadStatus::Ready;
                state.active = Some(model.clone());
            }
            Err(e) => {
                // nothing is kept, the next caller retries from the primary
                state.status = LoadStatus::Failed;
                state.active = None;
                state.last_error = Some(e.to_string());
            }
        }
    }
}
