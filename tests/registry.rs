use async_trait::async_trait;
use kube_informers::{
    errors::{classify, ErrorClass},
    GroupVersionResource, Informer, InformerKey, InformerOptions, InformerRegistry,
    RegistryError, RegistryParams,
};
use parking_lot::Mutex;
use std::{
    io::Write,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Becomes synced as soon as it is started (if `syncs` is set).
#[derive(Default)]
struct StubInformer {
    syncs: bool,
    runs: AtomicUsize,
    synced: AtomicBool,
}

impl StubInformer {
    fn syncing() -> Self {
        StubInformer {
            syncs: true,
            ..Default::default()
        }
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Informer for StubInformer {
    async fn run(&self, cancel: CancellationToken) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.syncs {
            self.synced.store(true, Ordering::SeqCst);
        }
        cancel.cancelled().await
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Another informer type, used to check typed lookups.
struct OtherInformer;

#[async_trait]
impl Informer for OtherInformer {
    async fn run(&self, cancel: CancellationToken) {
        cancel.cancelled().await
    }

    fn has_synced(&self) -> bool {
        true
    }
}

fn key(resource: &str) -> InformerKey {
    InformerKey::new(
        GroupVersionResource::new("testgroup", "v1", resource),
        InformerOptions::default(),
    )
}

fn registry() -> InformerRegistry {
    InformerRegistry::new(RegistryParams {
        sync_log_interval: Some(Duration::from_millis(50)),
    })
}

/// Collects formatted log lines written while a closure runs.
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl CapturedLogs {
    fn contains(&self, needle: &str) -> bool {
        String::from_utf8_lossy(&self.0.lock()).contains(needle)
    }
}

fn with_captured_logs(f: impl FnOnce()) -> CapturedLogs {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    logs
}

async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn new_registry_is_empty_and_running() {
    let registry = InformerRegistry::default();
    assert!(!registry.is_shutting_down());
    assert!(registry.is_empty());
}

#[test]
fn informer_is_created_once_per_key() {
    let registry = registry();
    let calls = AtomicUsize::new(0);
    let make = || {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(StubInformer::default())
    };

    let first = registry.get_or_create(key("testresource"), make).unwrap();
    let second = registry
        .get_or_create(key("testresource"), || -> anyhow::Result<StubInformer> {
            panic!("constructor must not be called for existing key")
        })
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(first.informer(), second.informer()));
    assert_eq!(first.key(), &key("testresource"));
    assert_eq!(registry.len(), 1);
}

#[test]
fn different_keys_get_independent_informers() {
    let registry = registry();
    let a = registry
        .get_or_create(key("a"), || Ok(StubInformer::default()))
        .unwrap();
    let b = registry
        .get_or_create(key("b"), || Ok(StubInformer::default()))
        .unwrap();
    let namespaced = registry
        .get_or_create(
            InformerKey::new(
                GroupVersionResource::new("testgroup", "v1", "a"),
                InformerOptions::default().namespace("ns"),
            ),
            || Ok(StubInformer::default()),
        )
        .unwrap();

    assert!(!Arc::ptr_eq(a.informer(), b.informer()));
    assert!(!Arc::ptr_eq(a.informer(), namespaced.informer()));
    assert_eq!(registry.len(), 3);
    let mut keys = registry.keys();
    keys.sort_by_key(|k| k.to_string());
    assert_eq!(keys[0], key("a"));
}

#[test]
fn concurrent_callers_share_one_informer() {
    const THREADS: usize = 8;
    let registry = registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles = (0..THREADS)
        .map(|_| {
            let registry = registry.clone();
            let calls = calls.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                registry
                    .get_or_create(key("raced"), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        Ok(StubInformer::default())
                    })
                    .unwrap()
                    .into_informer()
            })
        })
        .collect::<Vec<_>>();
    let informers = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for informer in &informers {
        assert!(Arc::ptr_eq(informer, &informers[0]));
    }
}

#[test]
fn constructor_failure_registers_nothing() {
    let registry = registry();
    let err = registry
        .get_or_create(key("broken"), || -> anyhow::Result<StubInformer> {
            anyhow::bail!("no client")
        })
        .err()
        .unwrap();
    match &err {
        RegistryError::Construct { key: k, source } => {
            assert_eq!(k, &key("broken"));
            assert_eq!(source.to_string(), "no client");
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(registry.is_empty());

    // next attempt may succeed
    registry
        .get_or_create(key("broken"), || Ok(StubInformer::default()))
        .unwrap();
    assert_eq!(registry.len(), 1);
}

#[test]
fn type_mismatch_is_reported() {
    let registry = registry();
    registry
        .get_or_create(key("typed"), || Ok(StubInformer::default()))
        .unwrap();
    let err = registry
        .get_or_create(key("typed"), || Ok(OtherInformer))
        .err()
        .unwrap();
    assert!(matches!(err, RegistryError::TypeMismatch { .. }));
}

#[test]
fn shutdown_is_idempotent() {
    let registry = registry();
    registry.shutdown();
    assert!(registry.is_shutting_down());
    registry.shutdown();
    assert!(registry.is_shutting_down());
}

#[test]
fn no_new_informers_after_shutdown() {
    let registry = registry();
    let existing = registry
        .get_or_create(key("existing"), || Ok(StubInformer::default()))
        .unwrap();
    registry.shutdown();

    let err = registry
        .get_or_create(key("new"), || -> anyhow::Result<StubInformer> {
            panic!("constructor must not be called after shutdown")
        })
        .err()
        .unwrap();
    assert!(matches!(err, RegistryError::Closed));
    assert_eq!(classify(&anyhow::Error::new(err)), ErrorClass::Closed);
    assert_eq!(registry.len(), 1);

    let again = registry
        .get_or_create(key("existing"), || Ok(StubInformer::default()))
        .unwrap();
    assert!(Arc::ptr_eq(existing.informer(), again.informer()));
}

#[tokio::test]
async fn empty_registry_is_synced_even_if_cancelled() {
    let registry = registry();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(registry.wait_for_cache_sync(&cancel).await);
}

#[tokio::test]
async fn cancellation_before_sync_returns_false() {
    let registry = registry();
    let stub = registry
        .get_or_create(key("slow"), || Ok(StubInformer::default()))
        .unwrap();
    let cancel = CancellationToken::new();
    registry.start(&cancel);

    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };
    assert!(!registry.wait_for_cache_sync(&cancel).await);
    canceller.await.unwrap();
    assert!(!stub.informer().has_synced());
}

#[tokio::test]
async fn start_then_wait_for_sync() {
    let registry = registry();
    let stub = registry
        .get_or_create(key("pods"), || Ok(StubInformer::syncing()))
        .unwrap();
    assert!(!stub.informer().has_synced());

    let cancel = CancellationToken::new();
    registry.start(&cancel);
    assert!(registry.wait_for_cache_sync(&cancel).await);
    assert!(stub.informer().has_synced());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_runs_each_informer_once() {
    let registry = registry();
    let early = registry
        .get_or_create(key("early"), || Ok(StubInformer::syncing()))
        .unwrap();
    let cancel = CancellationToken::new();
    registry.start(&cancel);
    registry.start(&cancel);

    // registered after start: not started automatically
    let late = registry
        .get_or_create(key("late"), || Ok(StubInformer::syncing()))
        .unwrap();
    eventually("early informer to run", || early.informer().runs() == 1).await;
    assert!(!registry.is_started(late.key()));
    assert_eq!(late.informer().runs(), 0);

    late.start(&cancel);
    late.start(&cancel);
    registry.start(&cancel);
    assert!(registry.wait_for_cache_sync(&cancel).await);
    assert_eq!(early.informer().runs(), 1);
    assert_eq!(late.informer().runs(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn start_after_shutdown_does_nothing() {
    let registry = registry();
    let stub = registry
        .get_or_create(key("pods"), || Ok(StubInformer::syncing()))
        .unwrap();
    registry.shutdown();

    let cancel = CancellationToken::new();
    registry.start(&cancel);
    stub.start(&cancel);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stub.informer().runs(), 0);
    assert!(!registry.is_started(stub.key()));
}

#[tokio::test]
async fn stopped_after_shutdown_and_cancel() {
    let registry = registry();
    let stub = registry
        .get_or_create(key("pods"), || Ok(StubInformer::syncing()))
        .unwrap();
    let cancel = CancellationToken::new();
    registry.start(&cancel);
    assert!(registry.wait_for_cache_sync(&cancel).await);

    registry.shutdown();
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), registry.stopped())
        .await
        .expect("informers did not stop");
    assert_eq!(stub.informer().runs(), 1);
}

#[test]
fn overlap_warning_only_for_created_informers() {
    let registry = registry();
    let pods = GroupVersionResource::new("", "v1", "pods");
    let all_namespaces = InformerKey::new(pods.clone(), InformerOptions::default());
    let in_namespace = InformerKey::new(pods, InformerOptions::default().namespace("a"));

    let logs = with_captured_logs(|| {
        registry
            .get_or_create(all_namespaces, || Ok(StubInformer::default()))
            .unwrap();
        let failed = registry.get_or_create(
            in_namespace.clone(),
            || -> anyhow::Result<StubInformer> { anyhow::bail!("no client") },
        );
        assert!(failed.is_err());
    });
    assert!(logs.contains("Failed to construct informer"));
    assert!(!logs.contains("cached twice"));

    let logs = with_captured_logs(|| {
        registry
            .get_or_create(in_namespace, || Ok(StubInformer::default()))
            .unwrap();
    });
    assert!(logs.contains("cached twice"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn start_outside_runtime_leaves_informers_unstarted() {
    let registry = registry();
    let stub = registry
        .get_or_create(key("pods"), || Ok(StubInformer::syncing()))
        .unwrap();
    let cancel = CancellationToken::new();

    assert!(catch_unwind(AssertUnwindSafe(|| registry.start(&cancel))).is_err());
    assert!(catch_unwind(AssertUnwindSafe(|| stub.start(&cancel))).is_err());
    assert!(!registry.is_started(stub.key()));

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let synced = runtime.block_on(async {
        registry.start(&cancel);
        registry.wait_for_cache_sync(&cancel).await
    });
    assert!(synced);
    assert!(registry.is_started(stub.key()));
    assert_eq!(stub.informer().runs(), 1);
    cancel.cancel();
}

#[tokio::test]
async fn zero_sync_log_interval_uses_default() {
    let registry = InformerRegistry::new(RegistryParams {
        sync_log_interval: Some(Duration::ZERO),
    });
    let stub = registry
        .get_or_create(key("pods"), || Ok(StubInformer::syncing()))
        .unwrap();
    let cancel = CancellationToken::new();
    registry.start(&cancel);
    assert!(registry.wait_for_cache_sync(&cancel).await);
    assert!(stub.informer().has_synced());
    cancel.cancel();
}
