//! Payment SOAP client binary.
//!
//! Run with: `payment-soap-client --config settings.yaml --request request.yaml`

use anyhow::{Context, Result};
use clap::Parser;
use payment_soap_client::{install_transport_defaults, ClientSettings, RequestMessage, SoapClient};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Send one transaction to the payment service and print the reply.
///
/// The request is read from a YAML file. The reply is printed as JSON.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to settings file (YAML)
    #[arg(short, long, default_value = "payment-soap-client.yaml")]
    config: PathBuf,

    /// Path to the request file (YAML)
    #[arg(short, long)]
    request: PathBuf,

    /// Merchant ID, overrides the one in the request
    #[arg(short, long)]
    merchant_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    info!("Starting payment SOAP client v{}", env!("CARGO_PKG_VERSION"));

    let settings = if args.config.exists() {
        info!("Settings file: {}", args.config.display());
        ClientSettings::load(&args.config).context("Failed to load settings file")?
    } else {
        info!("Settings file not found, using defaults");
        ClientSettings::default()
    };

    info!(
        default_merchant = settings.merchant_id.as_deref().unwrap_or(""),
        merchants = settings.merchants.len(),
        connection_limit = settings.transport.connection_limit,
        "Settings loaded"
    );

    install_transport_defaults(settings.transport);

    let content = tokio::fs::read_to_string(&args.request)
        .await
        .context("Failed to read request file")?;
    let mut request: RequestMessage =
        serde_yaml::from_str(&content).context("Failed to parse request file")?;
    if let Some(merchant_id) = args.merchant_id {
        request.merchant_id = Some(merchant_id);
    }

    let client = SoapClient::new(settings);
    let reply = client
        .run_transaction_default(&mut request)
        .await
        .context("Transaction failed")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&reply).context("Failed to encode reply")?
    );
    Ok(())
}
