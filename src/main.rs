use std::path::PathBuf;
use std::sync::Arc;

use betproxy::ca::RootAuthority;
use betproxy::{DirectClient, ProxyService};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Intercepting HTTP/HTTPS forward proxy", long_about = None)]
struct Args {
    /// Port to listen on.
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Directory holding (or to generate) the root CA's cert_key.pem pair.
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Accept any upstream TLS certificate. Use only against test origins.
    #[arg(long, default_value_t = false)]
    skip_tls_verify: bool,

    /// tracing `EnvFilter` directive, e.g. "debug" or "betproxy=trace".
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let ca_dir = args
        .ca_dir
        .or_else(|| dirs::home_dir().map(|h| h.join(".betproxy")))
        .ok_or_else(|| anyhow::anyhow!("could not determine a CA directory; pass --ca-dir"))?;

    let authority = RootAuthority::load_or_generate(&ca_dir)
        .map_err(|e| anyhow::anyhow!("failed to load or generate root CA: {e}"))?;

    let mut service = ProxyService::bind(&format!("0.0.0.0:{}", args.port), authority).await?;
    service.set_client(Arc::new(DirectClient::new(args.skip_tls_verify)));

    tracing::info!(port = args.port, ca_dir = %ca_dir.display(), "betproxy listening");
    service.listen().await?;
    Ok(())
}
