use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use speedtest_exporter::config::ExporterConfig;
use speedtest_exporter::http_server;
use speedtest_exporter::metrics::ExporterMetrics;
use speedtest_exporter::runner::Runner;
use speedtest_exporter::speedtest::CommandSpeedTest;
use speedtest_exporter::version::VERSION;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Location of the config file (`.toml` for TOML, JSON otherwise)
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Also write JSON logs to a daily rotated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn init_logging(log_dir: Option<&PathBuf>) {
    let stdout_layer = fmt::layer().with_writer(std::io::stdout).json();

    let file_layer = log_dir.map(|dir| {
        fmt::layer()
            .with_writer(rolling::daily(dir, "speedtest_exporter.log"))
            .with_ansi(false)
            .json()
    });

    // Default to `info` if RUST_LOG is not set.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT."),
                    _ = sigterm.recv() => info!("Received SIGTERM."),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Unable to listen for SIGTERM, waiting for Ctrl-C only."),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Unable to listen for Ctrl-C.");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    init_logging(args.log_dir.as_ref());
    info!(version = VERSION, "Starting speedtest_exporter...");

    let config = match ExporterConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Critical error loading configuration. Exiting.");
            return Err(e.into());
        }
    };

    let metrics = ExporterMetrics::new()?;

    let (http_shutdown_tx, http_shutdown_rx) = watch::channel(false);
    let http_task = tokio::spawn({
        let metrics = metrics.clone();
        let listen_address = config.listen_address.clone();
        async move {
            if let Err(e) = http_server::serve(&listen_address, metrics, http_shutdown_rx).await {
                error!(address = %listen_address, error = %e, "Metrics server failed.");
            }
        }
    });

    let speed_test = Arc::new(CommandSpeedTest::new(Arc::new(config.command)));
    let mut runner = Runner::new(speed_test, config.servers, config.tick, metrics);
    runner.start();

    info!("speedtest_exporter is running");
    wait_for_shutdown_signal().await;
    info!("Shutting down");

    if let Err(e) = runner.close().await {
        error!(error = %e, "Speed test runner did not stop cleanly.");
    }
    http_shutdown_tx.send_replace(true);
    if let Err(e) = http_task.await {
        error!(error = %e, "Metrics server task panicked.");
    }

    info!("Done shutting down");
    Ok(())
}
