use std::sync::Arc;

use coap2mqtt::bridge::BridgeGroup;
use coap2mqtt::coap::transport::UdpCoapConnector;
use coap2mqtt::config;
use coap2mqtt::mqtt::MqttConnection;
use color_eyre::Result;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = config::load()?;
    let connector = Arc::new(UdpCoapConnector::default());
    let bridges = Arc::new(BridgeGroup::new(&config.coap, connector)?);
    let connection = Arc::new(MqttConnection::new(&config.mqtt));

    let subscriber = {
        let connection = connection.clone();
        let bridges = bridges.clone();
        tokio::spawn(async move { connection.observe(bridges).await })
    };

    tokio::select! {
        _ = bridges.observe(connection.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
        }
    }
    bridges.shutdown().await;
    subscriber.abort();

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;

    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();
}
