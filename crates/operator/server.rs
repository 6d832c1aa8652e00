use actix_web::{dev::Server, middleware, web::Data, App, HttpServer};
use varnish_cluster::util::state::State;

use crate::handlers::{health, metrics};

/// Configure the HTTP server; the returned future serves until shutdown
pub fn build_server(state: State, address: &str) -> std::io::Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
    })
    .bind(address)?
    .shutdown_timeout(5);

    Ok(server.run())
}
