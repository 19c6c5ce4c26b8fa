//! ECK operator
//!
//! Runs the Elasticsearch disruption budget controller and the Enterprise
//! Search controller against the current Kubernetes cluster.

use anyhow::{Context, Result};
use clap::Parser;
use eck_operator::config::{rotation_from_hours, IpFamily, OperatorConfig};
use eck_operator::k8s::KubeClient;
use eck_operator::license::SecretLicenseChecker;
use eck_operator::{crd, elasticsearch, enterprisesearch};
use kube::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// ECK operator
#[derive(Parser, Debug)]
#[command(name = "eck-operator")]
#[command(about = "Kubernetes operator for Elasticsearch disruption budgets and Enterprise Search")]
#[command(version)]
struct Args {
    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health probe address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Namespace to watch (empty for cluster-wide)
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Namespace the operator runs in
    #[arg(long, env = "OPERATOR_NAMESPACE", default_value = "elastic-system")]
    operator_namespace: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// IP family of the managed workloads
    #[arg(long, env = "IP_FAMILY", value_enum, default_value = "ipv4")]
    ip_family: IpFamily,

    /// Validity of self-signed CA certificates, in hours
    #[arg(long, env = "CA_CERT_VALIDITY", default_value = "8760")]
    ca_cert_validity: u64,

    /// Rotate CA certificates this many hours before they expire
    #[arg(long, env = "CA_CERT_ROTATE_BEFORE", default_value = "24")]
    ca_cert_rotate_before: u64,

    /// Validity of HTTP certificates, in hours
    #[arg(long, env = "CERT_VALIDITY", default_value = "8760")]
    cert_validity: u64,

    /// Rotate HTTP certificates this many hours before they expire
    #[arg(long, env = "CERT_ROTATE_BEFORE", default_value = "24")]
    cert_rotate_before: u64,

    /// Do not run the PodDisruptionBudget controller
    #[arg(long, env = "DISABLE_PDB_CONTROLLER", default_value = "false")]
    disable_pdb_controller: bool,

    /// Do not run the Enterprise Search controller
    #[arg(long, env = "DISABLE_ENTERPRISE_SEARCH_CONTROLLER", default_value = "false")]
    disable_enterprise_search_controller: bool,

    /// Print CRD YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn operator_config(&self) -> Result<OperatorConfig> {
        Ok(OperatorConfig {
            namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            operator_namespace: self.operator_namespace.clone(),
            ip_family: self.ip_family,
            ca_rotation: rotation_from_hours(self.ca_cert_validity, self.ca_cert_rotate_before)
                .context("Invalid CA certificate rotation")?,
            cert_rotation: rotation_from_hours(self.cert_validity, self.cert_rotate_before)
                .context("Invalid certificate rotation")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print_crd()?;
        return Ok(());
    }

    init_logging(&args)?;
    let config = args.operator_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.namespace.as_deref().unwrap_or("all"),
        operator_namespace = %config.operator_namespace,
        "Starting ECK operator"
    );

    let metrics_addr = args.metrics_addr;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_addr).await {
            tracing::error!(error = %e, "Metrics server failed");
        }
    });

    let health_addr = args.health_addr;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_addr).await {
            tracing::error!(error = %e, "Health server failed");
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let pdb = async {
        if args.disable_pdb_controller {
            info!("PodDisruptionBudget controller disabled");
            return Ok(());
        }
        let kube_client = KubeClient::new(client.clone(), elasticsearch::controller::CONTROLLER_NAME);
        let license = Arc::new(SecretLicenseChecker::new(
            Arc::new(kube_client.clone()),
            config.operator_namespace.clone(),
        ));
        elasticsearch::controller::run_controller(kube_client, license, config.namespace.clone())
            .await
            .context("Elasticsearch controller failed")
    };

    let ent = async {
        if args.disable_enterprise_search_controller {
            info!("Enterprise Search controller disabled");
            return Ok(());
        }
        let kube_client = KubeClient::new(client.clone(), enterprisesearch::controller::CONTROLLER_NAME);
        enterprisesearch::controller::run_controller(kube_client, config.clone())
            .await
            .context("Enterprise Search controller failed")
    };

    let (pdb, ent) = futures::join!(pdb, ent);
    pdb?;
    ent?;

    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Answers `/healthz` and `/readyz` with 200
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let Ok(n) = socket.read(&mut buf).await else {
                return;
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let path = request.split_whitespace().nth(1).unwrap_or("/");
            let response = match path {
                "/healthz" | "/readyz" | "/" => "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK",
                _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 9\r\n\r\nNot Found",
            };
            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Print every CRD as a YAML stream
fn print_crd() -> Result<()> {
    for crd in crd::all_crds()? {
        println!("---");
        print!("{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
