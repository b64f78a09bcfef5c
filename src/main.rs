use clap::{Args, Parser};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Namespace, Node, Pod, Secret, Service,
};
use kube::{api::ListParams, runtime::watcher};
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use api::{ExternalDNS, IngressLink, Ipam, LbPolicy, Route, TLSProfile, TransportServer, VirtualServer};
use ipam::{IpamManager, KubeIpam};
use members::PoolMemberMode;
use queue::TaskQueue;
use status::KubeStatus;
use worker::{Controller, ControllerOptions};

mod api;
mod assoc;
mod extended;
mod ipam;
mod k8s;
mod members;
mod metrics;
mod model;
mod publish;
mod queue;
mod routes;
mod status;
mod store;
mod virtuals;
mod worker;

// TODO: multi-cluster

/// derives BIG-IP declarations from cluster resources
#[derive(Parser, Debug)]
#[command(version)]
struct CliArgs {
    /// Log in a pretty, human-readable format.
    #[arg(long)]
    log_pretty: bool,

    /// The partition derived configs are filed under.
    #[arg(long, default_value = "k8s")]
    bigip_partition: String,

    /// The route domain appended to every virtual address.
    #[arg(long, default_value_t = 0)]
    default_route_domain: i32,

    /// How pool members are resolved.
    #[arg(long, default_value_t, value_enum)]
    pool_member_type: PoolMemberMode,

    /// Mark node records as shareable across partitions.
    #[arg(long)]
    share_nodes: bool,

    /// The global extended-spec ConfigMap, as `namespace/name`.
    #[arg(long, value_parser = parse_cm_ref)]
    extended_spec_configmap: (String, String),

    /// Request virtual addresses from the IPAM controller instead of reading
    /// them off each resource.
    #[arg(long)]
    ipam: bool,

    /// The namespace the IPAM resource lives in.
    #[arg(long, default_value = "kube-system")]
    ipam_namespace: String,

    /// The name of the IPAM resource.
    #[arg(long, default_value = "deckhand.ipam")]
    ipam_name: String,

    /// The local address the prometheus exporter listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    metrics_addr: String,

    #[command(flatten)]
    namespace_args: NamespaceArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct NamespaceArgs {
    /// Watch a single namespace instead of the whole cluster.
    ///
    /// It's an error to set both --namespace and --namespace-label.
    #[arg(long)]
    namespace: Option<String>,

    /// Watch only namespaces carrying this label, as `key=value`. Route
    /// groups are resolved against the labeled namespaces.
    ///
    /// It's an error to set both --namespace and --namespace-label.
    #[arg(long)]
    namespace_label: Option<String>,
}

fn parse_cm_ref(s: &str) -> Result<(String, String), String> {
    match s.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => {
            Ok((ns.to_string(), name.to_string()))
        }
        _ => Err("expected namespace/name".to_string()),
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    setup_tracing(args.log_pretty);

    if let Err(e) = run(args).await {
        tracing::error!(err = ?e, "exiting: {e}");
        std::process::exit(1);
    }
}

fn setup_tracing(log_pretty: bool) {
    let default_log_filter = "deckhand=info"
        .parse()
        .expect("default log filter must be valid");
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_filter)
                .from_env_lossy(),
        )
        .with_target(true);

    if log_pretty {
        // don't use .pretty(), it's too pretty
        builder.init();
    } else {
        builder.json().flatten_event(true).with_span_list(false).init();
    }
}

async fn run(args: CliArgs) -> anyhow::Result<()> {
    metrics::install_prom(&args.metrics_addr)?;

    let client = kube::Client::try_default().await?;
    let namespace = args.namespace_args.namespace.as_deref();

    // count the services already in the cluster so the controller knows when
    // its warm-up is over and the first declaration can go out.
    let services: kube::Api<Service> = scoped_api(&client, namespace);
    let initial_svc_count = services
        .list(&ListParams::default())
        .await?
        .items
        .iter()
        .filter(|svc| {
            svc.spec.as_ref().and_then(|spec| spec.type_.as_deref()) != Some("ExternalName")
        })
        .count() as i64;

    let ipam = args.ipam.then(|| {
        IpamManager::new(Box::new(KubeIpam::new(
            client.clone(),
            &args.ipam_namespace,
            &args.ipam_name,
        )))
    });

    let (queue, rx) = queue::channel();
    let (publisher, declarations) = publish::channel();
    tokio::spawn(publish::run_agent(declarations, publish::LogAgent));

    let controller = Controller::new(
        ControllerOptions {
            default_partition: args.bigip_partition.clone(),
            default_route_domain: args.default_route_domain,
            share_nodes: args.share_nodes,
            mode: args.pool_member_type,
            global_cm: args.extended_spec_configmap.clone(),
            initial_svc_count,
        },
        queue.clone(),
        publisher,
        Box::new(KubeStatus::new(client.clone())),
        ipam,
    );
    tokio::spawn(controller.run(rx));

    let mut watches = JoinSet::new();

    // the CRD kinds need a little bit of extra error handling, in case the
    // APIs are not installed, installed at an incompatible version, or
    // someone removes a CRD at a weird time.
    watches.spawn(watch_crd::<Route>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch_crd::<VirtualServer>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch_crd::<TransportServer>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch_crd::<TLSProfile>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch_crd::<LbPolicy>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch_crd::<IngressLink>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch_crd::<ExternalDNS>(scoped_api(&client, namespace), queue.clone()));

    watches.spawn(watch::<Secret>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch::<Service>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch::<Endpoints>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch::<Pod>(scoped_api(&client, namespace), queue.clone()));
    watches.spawn(watch::<ConfigMap>(scoped_api(&client, namespace), queue.clone()));

    watches.spawn(watch::<Node>(kube::Api::all(client.clone()), queue.clone()));

    // the namespace watch narrows to the selected scope; in label mode the
    // labeled namespaces are the ones route groups resolve against.
    let mut ns_config = watcher::Config::default();
    if let Some(selector) = args.namespace_args.namespace_label.as_deref() {
        ns_config = ns_config.labels(selector);
    }
    if let Some(ns) = namespace {
        ns_config = ns_config.fields(&format!("metadata.name={ns}"));
    }
    let ns_api: kube::Api<Namespace> = kube::Api::all(client.clone());
    let ns_queue = queue.clone();
    watches.spawn(async move {
        k8s::run_watch(ns_api, ns_config, ns_queue).await?;
        Ok(())
    });

    if args.ipam {
        let api: kube::Api<Ipam> = kube::Api::namespaced(client.clone(), &args.ipam_namespace);
        let config =
            watcher::Config::default().fields(&format!("metadata.name={}", args.ipam_name));
        let queue = queue.clone();
        watches.spawn(async move {
            match k8s::run_watch(api, config, queue).await {
                Err(e) if k8s::is_api_not_found(&e) => {
                    tracing::warn!("IPAM API not found. Continuing without address management");
                    Ok(())
                }
                v => Ok(v?),
            }
        });
    }

    while let Some(joined) = watches.join_next().await {
        joined??;
    }
    Ok(())
}

fn scoped_api<K>(client: &kube::Client, namespace: Option<&str>) -> kube::Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(namespace) => kube::Api::namespaced(client.clone(), namespace),
        None => kube::Api::all(client.clone()),
    }
}

async fn watch<T: k8s::WatchedResource>(api: kube::Api<T>, queue: TaskQueue) -> anyhow::Result<()> {
    k8s::run_watch(api, watcher::Config::default(), queue).await?;
    Ok(())
}

async fn watch_crd<T: k8s::WatchedResource>(
    api: kube::Api<T>,
    queue: TaskQueue,
) -> anyhow::Result<()> {
    match k8s::run_watch(api, watcher::Config::default(), queue).await {
        Err(e) if k8s::is_api_not_found(&e) => {
            tracing::info!(
                kind = T::static_kind(),
                "API not found. Continuing without it"
            );
            Ok(())
        }
        v => Ok(v?),
    }
}
