//! headcnid - the long-lived node daemon
//!
//! Brings the mesh daemon up and keeps it authenticated, advertises the
//! node's pod CIDR, answers pod-ready notifications from the plugin, and
//! runs the health/recovery loop with an HTTP surface for kubelet probes.

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use headcni::config::{node_name, DaemonConfig};
use headcni::health::HealthMonitor;
use headcni::ipam::{AllocationStrategy, IpamManager};
use headcni::mesh::{
    ConnectStateMachine, MeshClient, MeshSupervisor, RouteRegistry, ServiceOptions, UpOptions,
};
use headcni::netlink::detect_mesh_interface;
use headcni::notify::{self, NotifyResponse};

const MESH_SERVICE_NAME: &str = "headcni-mesh";

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::load()?;
    init_tracing(&config.log_level);
    info!("headcnid starting on node {}", node_name());

    let pod_cidr = config.pod_cidr()?;

    // Mesh daemon first; everything else needs its socket.
    let supervisor = Arc::new(MeshSupervisor::new());
    let service_options = ServiceOptions {
        mode: config.mesh_mode(),
        state_dir: config.state_dir.join("tailscale"),
        socket_path: config.socket_path.clone(),
        ..Default::default()
    };
    let service = supervisor
        .start_service(MESH_SERVICE_NAME, service_options)
        .await
        .context("failed to start mesh service")?;
    let client = MeshClient::new(&service.socket_path);

    // Authenticate and wait for full connectivity.
    let up_options = UpOptions {
        control_url: config.control_url.clone(),
        auth_key: config.resolved_auth_key()?,
        hostname: config.resolved_hostname(),
        accept_routes: config.accept_routes,
        advertise_routes: vec![pod_cidr.to_string()],
        shields_up: config.shields_up,
        accept_dns: config.accept_dns,
    };
    let machine = ConnectStateMachine::new(client.clone());
    let status = machine
        .up_with_options_with_retry(&up_options)
        .await
        .context("failed to connect to the mesh")?;
    info!(
        "mesh connected as {:?}",
        status
            .self_status
            .ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
    );

    // Make sure remote nodes can route to our pods.
    let registry = Arc::new(RouteRegistry::new(client.clone()));
    registry.sync_routes().await?;
    registry
        .ensure_pool_route(ipnet::IpNet::V4(pod_cidr))
        .await
        .context("failed to advertise the pod CIDR")?;

    let ipam = Arc::new(IpamManager::new(
        pod_cidr,
        &node_name(),
        &config.ipam_state_dir(),
        AllocationStrategy::Sequential,
    )?);

    let monitor = Arc::new(HealthMonitor::new(
        client.clone(),
        ipam.clone(),
        up_options,
        detect_mesh_interface(None),
        Duration::from_secs(config.health_interval_secs),
        config.failure_threshold,
    ));
    let health_task = tokio::spawn(monitor.clone().run());

    // Pod-ready notifications from the plugin.
    let notify_socket = config.daemon_socket.clone();
    let notify_task = tokio::spawn(async move {
        let result = notify::serve(&notify_socket, |request| {
            info!(
                "pod ready: {}/{} at {} (pool {})",
                request.namespace, request.pod_name, request.pod_ip, request.local_pool
            );
            NotifyResponse {
                success: true,
                error: None,
            }
        })
        .await;
        if let Err(e) = result {
            error!("notification socket failed: {}", e);
        }
    });

    let gc_task = tokio::spawn(gc_loop(
        ipam.clone(),
        Duration::from_secs(config.gc_interval_secs),
        Duration::from_secs(config.gc_max_age_secs),
    ));

    let http_task = tokio::spawn(serve_health(config.health_addr.clone(), monitor.clone()));

    info!("headcnid running; health surface on {}", config.health_addr);
    shutdown_signal().await;
    warn!("shutdown signal received, stopping");

    health_task.abort();
    notify_task.abort();
    gc_task.abort();
    http_task.abort();
    ipam.flush().await;

    // Owned daemons are torn down; a shared system daemon is left alone.
    for (name, e) in supervisor.stop_all().await {
        warn!("failed to stop {}: {}", name, e);
    }

    info!("headcnid stopped");
    Ok(())
}

/// Sweep stale IPAM records on a slow cadence, asking the API server
/// whether each pod still exists.
async fn gc_loop(ipam: Arc<IpamManager>, interval: Duration, max_age: Duration) {
    let kube_client = match kube::Client::try_default().await {
        Ok(client) => Some(client),
        Err(e) => {
            warn!("no Kubernetes API access, IPAM GC will keep all records: {}", e);
            None
        }
    };

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let client = kube_client.clone();
        let swept = ipam
            .garbage_collect(max_age, move |namespace, name| {
                let client = client.clone();
                async move {
                    match client {
                        Some(client) => pod_exists(client, &namespace, &name).await,
                        // Without an API server, keep everything.
                        None => true,
                    }
                }
            })
            .await;
        if swept > 0 {
            info!("IPAM GC swept {} stale allocation(s)", swept);
        }
    }
}

async fn pod_exists(client: kube::Client, namespace: &str, name: &str) -> bool {
    use k8s_openapi::api::core::v1::Pod;
    let pods: kube::Api<Pod> = kube::Api::namespaced(client, namespace);
    match pods.get_opt(name).await {
        Ok(found) => found.is_some(),
        // On API errors, err on the side of keeping the allocation.
        Err(e) => {
            warn!("pod liveness lookup {}/{} failed: {}", namespace, name, e);
            true
        }
    }
}

async fn serve_health(addr: String, monitor: Arc<HealthMonitor>) {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
        .route("/metrics", get(metrics))
        .with_state(monitor);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("cannot bind health surface on {}: {}", addr, e);
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("health surface failed: {}", e);
    }
}

async fn healthz(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let report = monitor.probe().await;
    let code = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn readyz(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    let report = monitor.probe().await;
    let ready = report.healthy && !monitor.is_recovering();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

async fn livez(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    if monitor.is_live() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "sweep wedged")
    }
}

async fn metrics(State(monitor): State<Arc<HealthMonitor>>) -> impl IntoResponse {
    monitor.metrics_text()
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env("HEADCNI_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
