//! Memoizing factory of informers.
//!
//! One informer is kept per distinct `InformerKey`. Informers are created
//! on demand, started in bulk and never removed. After `shutdown` no new
//! informers are created.

use crate::{errors::RegistryError, informer::Informer, key::InformerKey, wait};
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::runtime::Handle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

const DEFAULT_SYNC_LOG_INTERVAL: u64 = 5;

#[derive(Debug, Clone, Default)]
pub struct RegistryParams {
    /// Override how often `wait_for_cache_sync` logs caches that are still
    /// syncing. Default is 5 seconds, which is also used for zero.
    pub sync_log_interval: Option<Duration>,
}

impl RegistryParams {
    fn sync_log_interval(&self) -> Duration {
        self.sync_log_interval
            .filter(|d| !d.is_zero())
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_SYNC_LOG_INTERVAL))
    }
}

// Looked up before touching the started set, so that a call outside of
// a runtime leaves nothing marked as started.
fn current_runtime() -> Handle {
    match Handle::try_current() {
        Ok(handle) => handle,
        Err(err) => panic!("informers must be started inside Tokio runtime: {}", err),
    }
}

struct Entry {
    informer: Arc<dyn Informer>,
    // same object, kept for downcasting to the concrete type
    typed: Arc<dyn Any + Send + Sync>,
}

struct State {
    informers: HashMap<InformerKey, Entry>,
    started: HashSet<InformerKey>,
}

struct Inner {
    params: RegistryParams,
    state: Mutex<State>,
    // only written with `state` locked
    shutting_down: AtomicBool,
    tasks: TaskTracker,
}

/// Shared informer registry. Cloning is cheap, clones share all informers.
#[derive(Clone)]
pub struct InformerRegistry {
    inner: Arc<Inner>,
}

impl Default for InformerRegistry {
    fn default() -> Self {
        InformerRegistry::new(RegistryParams::default())
    }
}

impl InformerRegistry {
    pub fn new(params: RegistryParams) -> Self {
        InformerRegistry {
            inner: Arc::new(Inner {
                params,
                state: Mutex::new(State {
                    informers: HashMap::new(),
                    started: HashSet::new(),
                }),
                shutting_down: AtomicBool::new(false),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Returns informer registered for `key`, calling `make` to create it
    /// if there is none yet.
    ///
    /// `make` runs with the registry locked, so it is called at most once per
    /// key even if several callers race. It must not use the registry.
    ///
    /// After `shutdown` already registered informers are still returned, but
    /// creating new ones fails with `RegistryError::Closed`.
    pub fn get_or_create<I, F>(
        &self,
        key: InformerKey,
        make: F,
    ) -> Result<StartableInformer<I>, RegistryError>
    where
        I: Informer,
        F: FnOnce() -> anyhow::Result<I>,
    {
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.informers.get(&key) {
            let informer = entry.typed.clone().downcast::<I>().map_err(|_| {
                RegistryError::TypeMismatch {
                    key: key.clone(),
                    expected: std::any::type_name::<I>(),
                }
            })?;
            return Ok(self.startable(key, informer));
        }
        if self.is_shutting_down() {
            tracing::debug!(key = %key, "Refusing to create informer during shutdown");
            return Err(RegistryError::Closed);
        }
        let informer = match make() {
            Ok(i) => Arc::new(i),
            Err(err) => {
                tracing::warn!(key = %key, "Failed to construct informer: {:#}", err);
                return Err(RegistryError::Construct {
                    key,
                    source: err.into(),
                });
            }
        };
        tracing::info!(key = %key, "Created informer");
        for existing in state.informers.keys() {
            if existing.overlaps(&key) {
                tracing::warn!(
                    key = %key,
                    existing = %existing,
                    "Informer overlaps with an existing one, objects will be cached twice"
                );
            }
        }
        state.informers.insert(
            key.clone(),
            Entry {
                informer: informer.clone(),
                typed: informer.clone(),
            },
        );
        Ok(self.startable(key, informer))
    }

    fn startable<I: Informer>(&self, key: InformerKey, informer: Arc<I>) -> StartableInformer<I> {
        StartableInformer {
            key,
            informer,
            registry: self.clone(),
        }
    }

    /// Starts all informers which were not started yet.
    ///
    /// Informers registered later are not started automatically: call
    /// `start` again or use `StartableInformer::start`.
    /// Does nothing after `shutdown`.
    ///
    /// # Panics
    /// Panics if called outside of Tokio runtime.
    pub fn start(&self, cancel: &CancellationToken) {
        let runtime = current_runtime();
        let mut state = self.inner.state.lock();
        if self.is_shutting_down() {
            tracing::debug!("Registry is shutting down, not starting informers");
            return;
        }
        let state = &mut *state;
        for (key, entry) in &state.informers {
            if state.started.insert(key.clone()) {
                self.spawn(&runtime, key, entry.informer.clone(), cancel.clone());
            }
        }
    }

    fn start_one(&self, key: &InformerKey, informer: Arc<dyn Informer>, cancel: &CancellationToken) {
        let runtime = current_runtime();
        let mut state = self.inner.state.lock();
        if self.is_shutting_down() {
            tracing::debug!(key = %key, "Registry is shutting down, not starting informer");
            return;
        }
        if state.started.insert(key.clone()) {
            self.spawn(&runtime, key, informer, cancel.clone());
        }
    }

    fn spawn(
        &self,
        runtime: &Handle,
        key: &InformerKey,
        informer: Arc<dyn Informer>,
        cancel: CancellationToken,
    ) {
        let span = tracing::info_span!("informer", key = %key);
        let fut = async move {
            tracing::info!("Starting informer");
            tokio::select! {
                _ = informer.run(cancel.clone()) => {
                    tracing::info!("Informer exited")
                },
                _ = cancel.cancelled() => {
                    tracing::info!("Informer was cancelled")
                }
            }
        };
        self.inner.tasks.spawn_on(fut.instrument(span), runtime);
    }

    /// Marks registry as shutting down. Running informers are not
    /// affected: they stop when the token passed to `start` is cancelled.
    pub fn shutdown(&self) {
        let _state = self.inner.state.lock();
        if !self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            tracing::info!("Informer registry is shutting down");
            self.inner.tasks.close();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Resolves when `shutdown` was called and every started
    /// informer has returned.
    pub async fn stopped(&self) {
        self.inner.tasks.wait().await
    }

    /// Waits until all informers registered at the moment of the call
    /// report initial sync. Returns false if `cancel` fired first.
    ///
    /// Informers which were never started never sync, so callers
    /// usually `start` the registry before waiting.
    pub async fn wait_for_cache_sync(&self, cancel: &CancellationToken) -> bool {
        let informers = {
            let state = self.inner.state.lock();
            state
                .informers
                .iter()
                .map(|(key, entry)| (key.clone(), entry.informer.clone()))
                .collect::<Vec<_>>()
        };
        wait::wait_for_sync(informers, cancel, self.inner.params.sync_log_interval()).await
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().informers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<InformerKey> {
        self.inner.state.lock().informers.keys().cloned().collect()
    }

    pub fn is_started(&self, key: &InformerKey) -> bool {
        self.inner.state.lock().started.contains(key)
    }
}

/// Informer returned from the registry, together with a way
/// to start just this informer.
pub struct StartableInformer<I> {
    key: InformerKey,
    informer: Arc<I>,
    registry: InformerRegistry,
}

impl<I: Informer> StartableInformer<I> {
    pub fn informer(&self) -> &Arc<I> {
        &self.informer
    }

    pub fn into_informer(self) -> Arc<I> {
        self.informer
    }

    pub fn key(&self) -> &InformerKey {
        &self.key
    }

    /// Starts this informer unless it is already running.
    /// Does nothing after registry shutdown.
    ///
    /// # Panics
    /// Panics if called outside of Tokio runtime.
    pub fn start(&self, cancel: &CancellationToken) {
        self.registry
            .start_one(&self.key, self.informer.clone(), cancel)
    }
}
