//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::applier::FileApplierSettings;
use crate::compiler::CompileOptions;
use crate::controller::{Backoff, ReconcileSettings};
use crate::watcher::{FilterSettings, WatcherSettings};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Run the controller
    Run(ControllerArgs),
    /// Print the CustomResourceDefinitions as YAML
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Namespaces to watch (comma separated). Empty watches all namespaces
    #[arg(long, env = "ATS_NAMESPACES", value_delimiter = ',')]
    pub namespaces: Vec<String>,

    /// Namespaces to ignore (comma separated)
    #[arg(long, env = "ATS_IGNORE_NAMESPACES", value_delimiter = ',')]
    pub ignore_namespaces: Vec<String>,

    /// Only serve Ingresses of this class
    #[arg(long, env = "ATS_INGRESS_CLASS")]
    pub ingress_class: Option<String>,

    /// Namespace the controller runs in
    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Name of this replica, used as the lease holder
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// ConfigMap in the controller namespace holding `proxy.config.*` records
    #[arg(long, env = "ATS_RECORDS_CONFIGMAP", default_value = "ats")]
    pub records_configmap: String,

    /// Traffic Server configuration directory
    #[arg(
        long,
        env = "ATS_CONFIG_DIR",
        default_value = "/opt/ats/etc/trafficserver"
    )]
    pub config_dir: PathBuf,

    /// Path to the traffic_ctl binary
    #[arg(long, env = "ATS_TRAFFIC_CTL", default_value = "traffic_ctl")]
    pub traffic_ctl: PathBuf,

    /// Command run after writing files; a non-zero exit rejects the config
    #[arg(long, env = "ATS_VERIFY_COMMAND")]
    pub verify_command: Option<String>,

    /// Name of the managed proxy target
    #[arg(long, default_value = "local")]
    pub target_name: String,

    /// DNS suffix of in-cluster services
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    /// Event coalescing window in milliseconds
    #[arg(long, default_value_t = 300)]
    pub debounce_ms: u64,

    /// Apply attempts per generation (0 = unlimited)
    #[arg(long, default_value_t = 5)]
    pub max_apply_attempts: u32,

    /// First retry delay in milliseconds
    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,

    /// Retry delay cap in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,

    /// Capacity of the watcher event queue
    #[arg(long, default_value_t = 1024)]
    pub event_queue_capacity: usize,

    /// Capacity of the status update queue
    #[arg(long, default_value_t = 1024)]
    pub status_queue_capacity: usize,

    /// Health and metrics listener
    #[arg(long, env = "ATS_HEALTH_ADDRESS", default_value = "0.0.0.0:8080")]
    pub health_address: SocketAddr,

    /// Elect a leader for status writes. Without it this replica always writes
    #[arg(long, env = "ATS_LEADER_ELECTION", default_value_t = true, action = clap::ArgAction::Set)]
    pub leader_election: bool,

    /// Lease used for leader election
    #[arg(long, default_value = "ats-ingress-status")]
    pub lease_name: String,
}

impl ControllerArgs {
    pub fn filter_settings(&self) -> FilterSettings {
        FilterSettings {
            namespaces: non_empty(&self.namespaces),
            ignore_namespaces: non_empty(&self.ignore_namespaces),
            ingress_class: self.ingress_class.clone().filter(|c| !c.is_empty()),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            max_attempts: self.max_apply_attempts,
        }
    }

    pub fn watcher_settings(&self) -> WatcherSettings {
        WatcherSettings {
            filter: self.filter_settings(),
            controller_namespace: self.pod_namespace.clone(),
            records_configmap: self.records_configmap.clone(),
            queue_capacity: self.event_queue_capacity.max(1),
            ..WatcherSettings::default()
        }
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            backoff: self.backoff(),
        }
    }

    pub fn applier_settings(&self) -> FileApplierSettings {
        FileApplierSettings {
            target: self.target_name.clone(),
            config_dir: self.config_dir.clone(),
        }
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            cluster_domain: self.cluster_domain.clone(),
            config_dir: self.config_dir.to_string_lossy().into_owned(),
        }
    }
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}
