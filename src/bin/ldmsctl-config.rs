use std::process;

use clap::Parser;
use tracing::{error, warn};

use ldmsctl::cli::{init_logging, ConfigArgs};
use ldmsctl::controller::{self, ClusterConfig};
use ldmsctl::store::etcd::EtcdStore;

#[tokio::main]
async fn main() {
    let args = ConfigArgs::parse();
    init_logging(args.verbose);

    if args.version == 5 {
        warn!("version 5 output is reserved; writing version 4");
    }

    let cluster = match ClusterConfig::load(&args.cluster) {
        Ok(cluster) => cluster,
        Err(e) => {
            error!("failed to load cluster file: {e}");
            process::exit(1);
        }
    };

    let store = match EtcdStore::connect(&cluster.primary_endpoint()).await {
        Ok(store) => store,
        Err(e) => {
            error!(
                "failed to connect to datastore member {}: {e}",
                cluster.primary_endpoint()
            );
            process::exit(1);
        }
    };

    if let Err(e) = controller::run_configure(&store, &args.prefix, &args.ldms_config).await {
        error!("configuration failed: {e}");
        process::exit(1);
    }
}
