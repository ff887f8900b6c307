//! ats-ingress - a Kubernetes ingress controller for Apache Traffic Server.
//!
//! This is the main entry point that:
//! - Parses configuration and initializes structured logging
//! - Creates the Kubernetes client
//! - Runs leader election for status writes
//! - Starts the health server and the controller pipeline

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ats_ingress::config::{Cli, Commands, ControllerArgs};
use ats_ingress::crd::crd_manifests;
use ats_ingress::health::{HealthState, run_health_server};
use ats_ingress::run_controller;

/// Lease configuration
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let args = match cli.command {
        Commands::Crdgen => {
            print!("{}", crd_manifests()?);
            return Ok(());
        }
        Commands::Run(args) => args,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ats_ingress=info".parse()?)
                .add_directive("kube=info".parse()?)
                .add_directive("kube_leader_election=info".parse()?),
        )
        .json()
        .init();

    info!("Starting ats-ingress");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());
    let is_leader = Arc::new(AtomicBool::new(!args.leader_election));
    let cancel = CancellationToken::new();

    // Probes answer before the first apply
    let health_handle = {
        let health_state = health_state.clone();
        let addr = args.health_address;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, addr).await {
                error!("Health server error: {}", e);
            }
        })
    };

    if args.leader_election {
        tokio::spawn(run_leader_election(
            client.clone(),
            args.clone(),
            is_leader.clone(),
            cancel.clone(),
        ));
    } else {
        info!("Leader election disabled, this replica writes status");
    }

    let mut controller_handle = {
        let client = client.clone();
        let health_state = health_state.clone();
        let is_leader = is_leader.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            run_controller(client, &args, health_state, is_leader, cancel).await;
        })
    };

    tokio::select! {
        result = &mut controller_handle => {
            if let Err(e) = result {
                error!("Controller task panicked: {}", e);
            }
            cancel.cancel();
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
            cancel.cancel();
            let _ = controller_handle.await;
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");
            health_state.set_ready(false).await;
            cancel.cancel();

            // In-flight applies run to completion
            if let Err(e) = controller_handle.await {
                error!("Controller task panicked: {}", e);
            }
        }
    }

    info!("ats-ingress stopped");
    Ok(())
}

/// Hold or contend for the status lease until cancelled.
///
/// Losing the lease only stops status writes; the proxy keeps being
/// programmed by every replica.
async fn run_leader_election(
    client: Client,
    args: ControllerArgs,
    is_leader: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let holder_id = args.pod_name.clone().unwrap_or_else(|| {
        warn!("POD_NAME not set, using hostname");
        hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    info!(
        holder_id = %holder_id,
        namespace = %args.pod_namespace,
        lease_name = %args.lease_name,
        "Initializing leader election"
    );

    let lease_lock = LeaseLock::new(
        client,
        &args.pod_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: args.lease_name.clone(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    );

    loop {
        let leading = match lease_lock.try_acquire_or_renew().await {
            Ok(result) => result.acquired_lease,
            Err(e) => {
                warn!("Failed to acquire or renew lease: {}", e);
                false
            }
        };
        let was_leading = is_leader.swap(leading, Ordering::SeqCst);
        if leading && !was_leading {
            info!("Acquired leadership, writing status");
        } else if !leading && was_leading {
            warn!("Lost leadership, status writes paused");
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)) => {}
        }
    }
    is_leader.store(false, Ordering::SeqCst);
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the controller cannot shut
/// down gracefully without them.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
