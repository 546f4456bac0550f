use std::sync::Arc;

use kube::Client;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{reload, EnvFilter};

use sosreport_operator::controller;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let initial_level = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (filter, log_reload_handle) = reload::Layer::new(initial_level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let log_reload_handle = Arc::new(log_reload_handle);

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("no other rustls crypto provider installed yet");

    let client = Client::try_default().await?;
    controller::run(client, log_reload_handle).await
}
