use clap::Parser;
use kube_portforward::{ForwardSpec, LabelSelector, PortForward, ResourceType};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(name = "port-forward", about = "Port forward a local port into a kubernetes pod")]
struct CliArgs {
    /// Label to select the pod or service by, eg: app=etcd. May be repeated.
    #[clap(long, short = 'l', value_parser = parse_label)]
    label: Vec<(String, String)>,

    /// Name of the pod, takes precedence over the labels.
    #[clap(long)]
    resname: Option<String>,

    /// Local port to listen on, a free port is picked if left empty.
    #[clap(long, default_value = "0")]
    listen: u16,

    /// Port within the pod to forward to.
    #[clap(long, short, default_value = "80")]
    port: u16,

    /// Kubernetes namespace of the pod or service.
    #[clap(long, short = 'n', default_value = kube_portforward::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Select the pod directly rather than through the endpoints of a service.
    #[clap(long)]
    pod: bool,

    /// Path to kubeconfig file.
    #[clap(long, short = 'k')]
    kube_config_path: Option<PathBuf>,
}

fn parse_label(label: &str) -> Result<(String, String), String> {
    match label.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{label}'")),
    }
}

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = CliArgs::parse();

    let resource = if args.pod {
        ResourceType::Pod
    } else {
        ResourceType::Service
    };
    let selector = args
        .label
        .into_iter()
        .fold(LabelSelector::default(), |selector, (key, value)| {
            selector.with_label(key, value)
        });
    let spec = ForwardSpec::new(resource, args.port)
        .with_name(args.resname.unwrap_or_default())
        .with_selector(selector)
        .with_namespace(args.namespace)
        .with_listen_port(args.listen);

    let mut pf = PortForward::from_kubeconfig(spec, args.kube_config_path).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    pf.start(cancel.clone()).await?;
    tracing::info!(
        pod_name = pf.pod_name(),
        "Started tunnel on {}",
        pf.listen_port().unwrap_or_default()
    );

    tokio::select! {
        _ = cancel.cancelled() => pf.stop(),
        result = pf.wait() => return Ok(result?),
    }
    pf.wait().await?;
    Ok(())
}
