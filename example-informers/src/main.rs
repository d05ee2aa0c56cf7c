use anyhow::Context as _;
use clap::Parser;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::{api::ApiResource, core::GroupVersionKind};
use kube_informers::{
    reflector::namespaced_api, GroupVersionResource, InformerKey, InformerOptions,
    InformerRegistry, InformerType, ReflectorInformer, RegistryParams,
};
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
struct Args {
    /// Namespace to watch pods and configmaps in. All namespaces if omitted.
    #[arg(long)]
    namespace: Option<String>,
    /// Label selector applied to pods and configmaps
    #[arg(long)]
    selector: Option<String>,
    /// YAML file listing additional resources to watch
    #[arg(long)]
    config: Option<PathBuf>,
    /// Give up if caches are not synced after this many seconds
    #[arg(long, default_value = "60")]
    sync_timeout: u64,
    /// How often to report caches which are still syncing, in seconds
    #[arg(long)]
    sync_log_interval: Option<u64>,
}

#[derive(Deserialize, Default)]
struct InformersConfig {
    #[serde(default)]
    informers: Vec<ResourceConfig>,
}

#[derive(Deserialize)]
struct ResourceConfig {
    #[serde(default)]
    group: String,
    version: String,
    kind: String,
    plural: String,
    #[serde(flatten)]
    options: InformerOptions,
}

impl ResourceConfig {
    fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

fn read_config(path: Option<&PathBuf>) -> anyhow::Result<InformersConfig> {
    let path = match path {
        Some(p) => p,
        None => return Ok(InformersConfig::default()),
    };
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_yaml::from_str(&data).context("failed to parse informers config")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    tracing::info!(args = ?args, "parsed command-line arguments");
    let config = read_config(args.config.as_ref())?;

    tracing::info!("Connecting to kube");
    let client = kube::Client::try_default().await?;

    let registry = InformerRegistry::new(RegistryParams {
        sync_log_interval: args.sync_log_interval.map(Duration::from_secs),
    });

    let mut options = InformerOptions::default();
    options.namespace = args.namespace.clone();
    options.label_selector = args.selector.clone();

    let pods = registry.get_or_create(
        InformerKey::new(GroupVersionResource::of::<Pod>(), options.clone()),
        || {
            Ok(ReflectorInformer::<Pod>::new(
                namespaced_api(client.clone(), &options),
                &options,
            ))
        },
    )?;
    let configmaps = registry.get_or_create(
        InformerKey::new(GroupVersionResource::of::<ConfigMap>(), options.clone()),
        || {
            Ok(ReflectorInformer::<ConfigMap>::new(
                namespaced_api(client.clone(), &options),
                &options,
            ))
        },
    )?;
    let mut dynamic = Vec::new();
    for res in &config.informers {
        let ar = res.api_resource();
        let options = res.options.clone().informer_type(InformerType::Dynamic);
        let key = InformerKey::new(GroupVersionResource::from_api_resource(&ar), options);
        let informer = registry
            .get_or_create(key.clone(), || {
                Ok(ReflectorInformer::dynamic(client.clone(), &ar, &key.options))
            })
            .with_context(|| format!("failed to register informer for {}", key))?;
        dynamic.push(informer);
    }

    let cancel = CancellationToken::new();
    registry.start(&cancel);

    let sync_cancel = cancel.child_token();
    {
        let sync_cancel = sync_cancel.clone();
        let timeout = Duration::from_secs(args.sync_timeout);
        tokio::task::spawn(async move {
            tokio::time::sleep(timeout).await;
            sync_cancel.cancel();
        });
    }
    if !registry.wait_for_cache_sync(&sync_cancel).await {
        registry.shutdown();
        cancel.cancel();
        anyhow::bail!("caches did not sync in {} seconds", args.sync_timeout);
    }

    tracing::info!(
        pods = pods.informer().store().state().len(),
        configmaps = configmaps.informer().store().state().len(),
        "Caches synced"
    );
    for informer in &dynamic {
        tracing::info!(
            key = %informer.key(),
            objects = informer.informer().store().state().len(),
            "Cache synced"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("Shutting down");
    registry.shutdown();
    cancel.cancel();
    registry.stopped().await;
    Ok(())
}
