//! Informer on top of kube-runtime's watcher and reflector

use crate::{informer::Informer, key::InformerOptions};
use async_trait::async_trait;
use futures::stream::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ApiResource, DynamicObject, Resource};
use kube_runtime::{
    reflector::{store::Writer, Store},
    watcher::{self, Event},
    WatchStreamExt,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::{
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio_util::sync::CancellationToken;

/// Returns `Api` watching the namespace from `options`, or all namespaces
/// if it is not set.
pub fn namespaced_api<K>(client: kube::Client, options: &InformerOptions) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match options.namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Keeps a local copy of all objects matching options in a `Store`.
pub struct ReflectorInformer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    api: Api<K>,
    config: watcher::Config,
    // taken by the first `run`
    writer: Mutex<Option<Writer<K>>>,
    store: Store<K>,
    synced: AtomicBool,
    on_synced: event_listener::Event,
}

impl<K> ReflectorInformer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    /// Creates informer, without contacting apiserver.
    /// Namespace from `options` is ignored: it is already applied to `api`.
    pub fn with_dynamic_type(
        api: Api<K>,
        options: &InformerOptions,
        dyntype: K::DynamicType,
    ) -> Self {
        let writer = Writer::new(dyntype);
        let store = writer.as_reader();
        ReflectorInformer {
            api,
            config: options.watcher_config(),
            writer: Mutex::new(Some(writer)),
            store,
            synced: AtomicBool::new(false),
            on_synced: event_listener::Event::new(),
        }
    }

    /// Reader of the cache. Empty until the informer has synced.
    pub fn store(&self) -> Store<K> {
        self.store.clone()
    }

    fn mark_synced(&self) {
        if !self.synced.swap(true, Ordering::SeqCst) {
            tracing::info!(objects = self.store.state().len(), "Initial list received");
            self.on_synced.notify(usize::MAX);
        }
    }
}

impl<K> ReflectorInformer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    pub fn new(api: Api<K>, options: &InformerOptions) -> Self {
        Self::with_dynamic_type(api, options, Default::default())
    }
}

impl ReflectorInformer<DynamicObject> {
    /// Creates informer for an arbitrary resource
    pub fn dynamic(client: kube::Client, res: &ApiResource, options: &InformerOptions) -> Self {
        let api = match options.namespace.as_deref() {
            Some(ns) => Api::namespaced_with(client, ns, res),
            None => Api::all_with(client, res),
        };
        Self::with_dynamic_type(api, options, res.clone())
    }
}

#[async_trait]
impl<K> Informer for ReflectorInformer<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    async fn run(&self, cancel: CancellationToken) {
        let writer = self.writer.lock().take();
        let writer = match writer {
            Some(w) => w,
            None => {
                tracing::warn!("Reflector is already running");
                return;
            }
        };
        let watch = kube_runtime::watcher(self.api.clone(), self.config.clone()).default_backoff();
        let reflector = kube_runtime::reflector::reflector(writer, watch);
        tokio::pin!(reflector);
        loop {
            let item = tokio::select! {
                item = reflector.next() => item,
                _ = cancel.cancelled() => {
                    tracing::debug!("Reflector was cancelled");
                    return;
                }
            };
            match item {
                Some(Ok(Event::InitDone)) => self.mark_synced(),
                Some(Ok(ev)) => tracing::trace!(event = ?ev, "Applied watch event"),
                Some(Err(err)) => tracing::warn!("watch error: {:#}", err),
                None => {
                    tracing::error!("watch closed");
                    return;
                }
            }
        }
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    async fn synced(&self) {
        loop {
            if self.has_synced() {
                return;
            }
            let listener = self.on_synced.listen();
            if self.has_synced() {
                return;
            }
            listener.await;
        }
    }
}
