use std::sync::Arc;

use tracing::{error, info};

use brokercore::Broker;
use brokercore::cluster::StandaloneCluster;
use brokercore::config::load_config;
use brokercore::persistence::{MemoryStore, SledStore, Store};
use brokercore::utils::logging;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let store: Arc<dyn Store> = match &settings.persistence.path {
        Some(path) => match SledStore::open(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(%path, error = %e, "failed to open store");
                std::process::exit(1);
            }
        },
        None => Arc::new(MemoryStore::new()),
    };

    let broker = match Broker::new(settings, store, Arc::new(StandaloneCluster)) {
        Ok(broker) => broker,
        Err(e) => {
            error!(error = %e, "failed to start broker");
            std::process::exit(1);
        }
    };
    if let Err(e) = broker.recover() {
        error!(error = %e, "store recovery failed");
    }
    broker.start_background();
    info!(address = %broker.settings().broker.address, "broker running, press ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    broker.shutdown();
}
