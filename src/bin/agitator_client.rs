// Agitator client: agitate for a while, then stop
//
// Usage: cargo run --bin agitator-client -- --host expres2 -t 30

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use fiber_agitator::agitator::AgitationRequest;
use fiber_agitator::client::AgitatorClient;
use fiber_agitator::config::DEFAULT_PORT;

/// Start a client connection to the agitator
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Exposure time in seconds
    #[arg(short, long, default_value_t = 10.0)]
    time: f64,

    /// Rotations of motor 1 over the exposure
    #[arg(short, long)]
    rotations: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let client = AgitatorClient::new(&args.host, args.port);

    let mut request = AgitationRequest::new(args.time);
    if let Some(rotations) = args.rotations {
        request = request.with_rotations(rotations);
    }

    let status = client.start(request).await?;
    println!("Started: {:?}", status);

    tokio::time::sleep(Duration::try_from_secs_f64(args.time.max(0.0))?).await;

    let status = client.stop().await?;
    println!("Stopped: {:?}", status);
    Ok(())
}
