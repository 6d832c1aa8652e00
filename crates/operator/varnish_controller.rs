mod handlers;
mod server;

use tracing::error;
use varnish_cluster::util::{config::SidecarConfig, state::State, telemetry};
use varnish_cluster::vcl::controller::{self, REPORTER};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SidecarConfig::from_env()?;
    telemetry::init(&config.log_level, config.log_format).await;

    let state = State::new(REPORTER);
    let controller = controller::run(state.clone(), config.clone());
    let server = server::build_server(state, &config.http_address)?;

    let (controller, server) = tokio::join!(controller, server);
    if let Err(e) = controller {
        error!("VCL controller stopped: {e}");
    }
    server?;
    Ok(())
}
