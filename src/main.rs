use actix_web::{middleware::Logger, web, App, HttpServer};
use log::{info, warn};
use std::path::Path;

use file_lifecycle::api;
use file_lifecycle::app_state::AppState;
use file_lifecycle::config::AppConfig;

fn init_logging(config_file: &str) {
    if Path::new(config_file).exists() {
        match log4rs::init_file(config_file, Default::default()) {
            Ok(()) => return,
            Err(e) => eprintln!("Failed to load log config {}: {}", config_file, e),
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    warn!("Log config {} not usable, logging to stderr", config_file);
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let config = AppConfig::load().map_err(std::io::Error::other)?;
    init_logging(&config.logging.config_file);

    let state = AppState::from_config(config).map_err(std::io::Error::other)?;
    let server_config = state.config.server.clone();

    if state.config.sweeper.enabled {
        state.sweeper().start_background();
    } else {
        warn!("Orphan sweeper disabled, detached files will not be reclaimed");
    }

    info!(
        "Starting file lifecycle server on {}:{}",
        server_config.host, server_config.port
    );
    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(data.clone())
            .app_data(web::PayloadConfig::default().limit(server_config.max_payload_size))
            .configure(api::configure)
    })
    .workers(server_config.workers.max(1))
    .bind((server_config.host.as_str(), server_config.port))?
    .run()
    .await
}
