mod handlers;
mod server;

use tracing::error;
use varnish_cluster::controllers::cluster_controller::{self, REPORTER};
use varnish_cluster::util::{config::OperatorConfig, state::State, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env()?;
    telemetry::init(&config.log_level, config.log_format).await;

    // Shared between the controller and the web server
    let state = State::new(REPORTER);
    let controller = cluster_controller::run(state.clone(), config.clone());

    // Start web server
    let server = server::build_server(state, &config.http_address)?;

    // Both runtimes implements graceful shutdown, so poll until both are done
    let (controller, server) = tokio::join!(controller, server);
    if let Err(e) = controller {
        error!("VarnishCluster controller stopped: {e}");
    }
    server?;
    Ok(())
}
