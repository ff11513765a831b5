//! vmware-autoshutdown: shut down a VMware host on an MQTT signal.
//!
//! Listens on a trigger topic; the configured payload arms a countdown and
//! anything else aborts it. When the countdown expires a shutdown script is
//! uploaded to the host over SFTP and executed over SSH. Every transition is
//! published to a report topic.

#![warn(clippy::all)]

mod bus;
mod cli;
mod config;
mod countdown;
mod dispatch;
mod executor;
mod reconnect;
mod remote;
mod report;
mod shell;
mod shutdown;
mod systemd;
#[cfg(test)]
mod testutil;
mod types;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reconnect::ReconnectPolicy;

/// How long an in-flight shutdown run may delay process exit.
const RUN_GRACE_PERIOD: Duration = Duration::from_secs(120);

/// Transport crates are chatty at debug; keep them at warn unless RUST_LOG
/// says otherwise.
const BASE_FILTER: &str = "russh=warn,russh_sftp=warn,rumqttc=warn";

fn init_tracing(level: types::LogLevel) {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) => EnvFilter::new(format!("{BASE_FILTER},{env}")),
        Err(_) => EnvFilter::new(format!("{BASE_FILTER},{}", level.as_str())),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    init_tracing(cli.log_level);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting vmware-autoshutdown");
    let config = config::Config::from_cli(cli)?;
    tracing::debug!(?config, "Configuration loaded");

    let systemd = systemd::SystemdNotifier::new(config.notify_systemd);
    let shutdown_token = shutdown::install_signal_handler()?;

    let (client, eventloop) = bus::connect(&config);
    let reporter = Arc::new(report::StatusReporter::new(
        Arc::new(client.clone()),
        config.report_topic.clone(),
        config.send_timeout,
        systemd,
    ));
    let connector = Arc::new(remote::SshConnector::from_config(&config)?);
    let executor = Arc::new(executor::ShutdownExecutor::new(
        &config,
        connector,
        reporter.clone(),
    ));
    let controller = countdown::Controller::new(config.countdown, reporter, executor);
    let dispatcher = dispatch::Dispatcher::new(
        config.shutdown_topic.clone(),
        &config.shutdown_payload,
        controller.clone(),
    );

    // The bus loop outlives the dispatcher so abort events raised while
    // closing the controller still reach the broker.
    let bus_token = CancellationToken::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let policy = ReconnectPolicy {
        base_delay_secs: config.reconnect_delay_secs,
        max_delay_secs: config.reconnect_max_delay_secs,
    };
    let bus_task = tokio::spawn(bus::run_event_loop(
        client,
        eventloop,
        config.shutdown_topic.clone(),
        tx,
        policy,
        bus_token.clone(),
    ));
    let dispatch_task = tokio::spawn(dispatcher.run(rx, shutdown_token.clone()));

    tracing::info!(
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        topic = %config.shutdown_topic,
        report_topic = %config.report_topic,
        countdown_secs = config.countdown.as_secs(),
        "Waiting for shutdown trigger"
    );
    systemd.notify_ready();
    systemd.notify_status("Waiting for shutdown trigger");

    shutdown_token.cancelled().await;
    systemd.notify_stopping();

    dispatch_task.await?;
    controller.close(RUN_GRACE_PERIOD).await;
    bus_token.cancel();
    bus_task.await?;

    tracing::info!("Stopped");
    Ok(())
}
