use clap::Parser;
use tokio::net::TcpListener;

use tracing::info;

use netframe::supervisor;

#[derive(clap::Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "0.0.0.0")]
    address: String,

    #[arg(long, default_value_t = 10000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let listener = TcpListener::bind(format!("{}:{}", args.address, args.port)).await?;
    info!("listening on {}", listener.local_addr()?);

    let (_shutdown, signal) = supervisor::shutdown();
    supervisor::serve(listener, signal, |socket, _addr| primetime::handler(socket)).await?;

    Ok(())
}
