use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use ldmsctl::cli::{init_logging, MonitorArgs};
use ldmsctl::comm::http::HttpCommunicator;
use ldmsctl::controller::{ClusterConfig, Monitor};
use ldmsctl::store::etcd::EtcdStore;

#[tokio::main]
async fn main() {
    let args = MonitorArgs::parse();
    init_logging(args.verbose);

    if args.version == 5 {
        warn!("version 5 output is reserved; running as version 4");
    }
    if args.dump {
        warn!("--dump is reserved and has no effect");
    }

    let cluster = match ClusterConfig::load(&args.cluster) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("failed to load cluster file: {e}");
            process::exit(1);
        }
    };

    let endpoint = cluster.primary_endpoint();
    let store = match EtcdStore::connect(&endpoint).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("failed to connect to datastore member {endpoint}: {e}");
            process::exit(1);
        }
    };

    let monitor = match Monitor::new(
        store,
        &args.prefix,
        Box::new(HttpCommunicator::create),
        args.start_aggregators,
    )
    .await
    {
        Ok(monitor) => monitor,
        Err(e) => {
            error!("failed to load desired state: {e}");
            process::exit(1);
        }
    };

    info!("monitoring fleet '{}' via {endpoint}", args.prefix);
    if let Err(e) = monitor.run().await {
        error!("monitor failed: {e}");
        process::exit(1);
    }
}
