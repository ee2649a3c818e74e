use std::io;
use std::process::ExitCode;
use std::thread;

use clap::Parser;
use relay::{Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rtsp-relay",
    about = "RTSP relay: one publisher per path, any number of players"
)]
struct Args {
    /// RTSP bind address (host:port)
    #[arg(long, short, default_value = relay::server::DEFAULT_BIND_ADDR)]
    bind: String,

    /// Shared UDP RTP socket address
    #[arg(long, default_value = "0.0.0.0:8000")]
    udp_rtp: String,

    /// Shared UDP RTCP socket address
    #[arg(long, default_value = "0.0.0.0:8001")]
    udp_rtcp: String,

    /// Only offer TCP interleaved transport
    #[arg(long)]
    no_udp: bool,

    /// Host advertised in SDP (defaults to the host in the request URI)
    #[arg(long)]
    public_host: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = ServerConfig::default().with_udp(&args.udp_rtp, &args.udp_rtcp);
    if args.no_udp {
        config = config.without_udp();
    }
    if let Some(host) = &args.public_host {
        config = config.with_public_host(host);
    }

    let mut server = Server::with_config(&args.bind, config);
    if let Err(e) = server.start() {
        tracing::error!(bind = %args.bind, error = %e, "failed to start relay");
        return ExitCode::FAILURE;
    }

    println!("RTSP relay on {}, press Enter to stop", args.bind);
    let mut input = String::new();
    match io::stdin().read_line(&mut input) {
        // No terminal attached: run until killed.
        Ok(0) | Err(_) => loop {
            thread::park();
        },
        Ok(_) => {}
    }

    server.stop();
    ExitCode::SUCCESS
}
