// src/main.rs
use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gateway_server::config::{Cli, GatewayTable};
use gateway_server::server::GatewayServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // -------- logging ----------
    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("gateway_server={level}").parse().unwrap())
                .add_directive(format!("ssgs_protocol={level}").parse().unwrap())
                .add_directive("tokio=warn".parse().unwrap()),
        )
        .compact()
        .init();

    // -------- authorized gateways ----------
    let table = GatewayTable::load(&cli.config)?;
    info!(
        config = %cli.config.display(),
        gateways = table.len(),
        "authorized-gateway table loaded"
    );

    // -------- server ----------
    let server = GatewayServer::bind(&cli.bind, table, |client| {
        let uid = client.uid();
        info!(gateway = %uid, remote = %client.remote_addr(), "gateway online");
        client.set_on_message(move |update| {
            info!(
                gateway = %uid,
                seal = %update.sensor_seal_uid.map(hex::encode).unwrap_or_default(),
                temperature_c = ?update.temperature,
                vibration_mm_s2 = ?update.vibration,
                rpm = ?update.rpm,
                voltage_v = ?update.voltage,
                msg_id = ?update.msg_id,
                "sensor seal update"
            );
        });
        client.set_on_reconnect(move || info!(gateway = %uid, "gateway back online"));
    })
    .await?;
    info!(bind = %cli.bind, "SSGS listening");

    let server_task = tokio::spawn(server.run());

    // -------- graceful shutdown ----------
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received; exiting.");
    server_task.abort();
    Ok(())
}
