use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fiber_agitator::agitator::{AgitationController, AgitatorError};
use fiber_agitator::config::{AgitatorConfig, CONNECT_ATTEMPTS};
use fiber_agitator::motor::{DriverPort, Roboclaw, SimulatedDriver};
use fiber_agitator::server;

type Error = Box<dyn std::error::Error + Send + Sync>;

/// Serve the fiber agitator to remote callers
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Serial port of the Roboclaw controller
    #[arg(short, long)]
    comport: Option<String>,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the in-memory controller instead of hardware
    #[arg(long)]
    simulate: bool,
}

fn open_controller(
    config: &AgitatorConfig,
    simulate: bool,
) -> Result<AgitationController<Box<dyn DriverPort>>, AgitatorError> {
    let driver: Box<dyn DriverPort> = if simulate {
        info!("Using simulated motor controller");
        Box::new(SimulatedDriver::new())
    } else {
        info!("Opening motor controller on {}", config.serial.comport);
        Box::new(Roboclaw::open_with(
            &config.serial.comport,
            &config.serial.roboclaw_settings(),
        )?)
    };

    AgitationController::new(driver, config.calibration.clone(), config.agitation.clone())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AgitatorConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(comport) = args.comport {
        config.serial.comport = comport;
    }

    let mut attempt = 1;
    let controller = loop {
        match open_controller(&config, args.simulate) {
            Ok(controller) => break controller,
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!("Error while connecting to agitator (attempt {}): {}", attempt, e);
                attempt += 1;
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => {
                error!("Maximum {} connection tries exceeded", CONNECT_ATTEMPTS);
                return Err(e.into());
            }
        }
    };
    let controller = Arc::new(Mutex::new(controller));

    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    server::serve(listener, Arc::clone(&controller), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
        }
    })
    .await?;

    // Motors go to zero before the serial port is released
    let stopped = tokio::task::spawn_blocking(move || {
        let mut controller = controller.lock().unwrap_or_else(PoisonError::into_inner);
        controller.shutdown()
    })
    .await?;
    if let Err(e) = stopped {
        error!("Failed to stop agitator on shutdown: {}", e);
        return Err(e.into());
    }

    info!("Agitator server stopped");
    Ok(())
}
