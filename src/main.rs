mod client;
mod clock;
mod config;
mod kalman_bias;
mod kalman_filter;
mod server;
mod wire;

use anyhow::{Context, Result};
use clock::MonotonicClock;
use config::Config;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

struct ProgramOptions {
    client: bool,
    ip_address: Option<String>,
    config_path: PathBuf,
}

fn read_program_options() -> Result<ProgramOptions> {
    let mut client = false;
    let mut ip_address = None;
    let mut config_path = PathBuf::from("ptpmon.toml");

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--client" | "--Client" => client = true,
            "--ip-address" | "--IpAddress" => {
                ip_address = Some(
                    args.next()
                        .context("--ip-address requires a value")?,
                );
            }
            "--config" => {
                config_path = PathBuf::from(
                    args.next().context("--config requires a value")?,
                );
            }
            other => anyhow::bail!("unrecognized argument: {other}"),
        }
    }

    if client && ip_address.is_none() {
        anyhow::bail!("--ip-address is required when --client is specified");
    }

    Ok(ProgramOptions {
        client,
        ip_address,
        config_path,
    })
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

fn load_or_create_config(path: &PathBuf) -> Result<Config> {
    if path.exists() {
        info!("Loading configuration from {}", path.display());
        Config::from_file(path)
    } else {
        warn!("Configuration file not found: {}", path.display());
        warn!("Creating example configuration...");
        Config::create_example_config(path).context("Failed to create example config")?;
        info!("Example configuration created at {}", path.display());
        Config::from_file(path)
    }
}

fn main() -> Result<()> {
    let options = read_program_options()?;

    let mut config = load_or_create_config(&options.config_path)?;
    if let Some(ip) = options.ip_address {
        config.network.master_address = Some(ip);
    }

    init_logging(&config.logging.level)?;

    info!("ptpmon v{}", env!("CARGO_PKG_VERSION"));
    info!(
        event_port = config.network.event_port,
        general_port = config.network.general_port,
        filter = %config.filter.variant,
        "Configuration loaded"
    );

    // Ctrl+C with a double-press confirmation window, same UX as before.
    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let ctrl_c_count = Arc::new(std::sync::atomic::AtomicU8::new(0));

    let shutdown_clone = Arc::clone(&shutdown_requested);
    let count_clone = Arc::clone(&ctrl_c_count);
    ctrlc::set_handler(move || {
        let count = count_clone.fetch_add(1, Ordering::SeqCst);
        if count == 0 {
            warn!("Ctrl+C received. Press again within 5 seconds to stop.");
            let count_disarm = Arc::clone(&count_clone);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_secs(5));
                if count_disarm.load(Ordering::SeqCst) == 1 {
                    count_disarm.store(0, Ordering::SeqCst);
                    info!("Shutdown cancelled, continuing.");
                }
            });
        } else {
            warn!("Shutdown confirmed, stopping...");
            shutdown_clone.store(true, Ordering::SeqCst);
            std::thread::spawn(|| {
                std::thread::sleep(std::time::Duration::from_secs(2));
                error!("Forced exit (shutdown timeout)");
                std::process::exit(0);
            });
        }
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, async move {
        let clock = Rc::new(MonotonicClock::new());
        let shutdown = Rc::new(std::cell::Cell::new(false));

        let poll_shutdown = {
            let shutdown = Rc::clone(&shutdown);
            let shutdown_requested = Arc::clone(&shutdown_requested);
            tokio::task::spawn_local(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));
                loop {
                    ticker.tick().await;
                    if shutdown_requested.load(Ordering::SeqCst) {
                        shutdown.set(true);
                        break;
                    }
                }
            })
        };

        if options.client {
            info!("Starting as PTP slave");
            let client = client::Client::bind(config, clock).await?;
            client.run(shutdown).await?;
        } else {
            info!("Starting as PTP master");
            let server = server::Server::bind(config, clock).await?;
            server.run(shutdown).await?;
        }

        poll_shutdown.abort();
        Ok::<(), anyhow::Error>(())
    })
}
