mod commands;

use access_point::{
    mock::{FixedSigner, MockAuthority},
    signer::{OpensslCmsSigner, Signer},
    ticket_cache::{FileTicketStore, TicketStore},
    transport::HttpSoapTransport,
    wsaa::WsaaClient,
    wsfe::WsfeClient,
    Environment, SoapTransport,
};
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{credentials::CertificateSource, AppConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ar-einv", version, about = "Electronic invoice authorization (CAE) against AFIP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the billing service's application, database and auth servers
    Dummy,
    /// List the issuer's enabled points of sale
    PointsOfSale,
    /// Last voucher number the authority holds for a point of sale and voucher type
    LastVoucher {
        #[arg(long)]
        point: u32,
        #[arg(long)]
        voucher_type: u32,
    },
    /// Store every `*.json` invoice under a directory as a draft
    Import { dir: PathBuf },
    /// Validate and submit a stored invoice
    Authorize { invoice_id: String },
    /// Print a stored invoice with its authorization fields
    Show { invoice_id: String },
    /// Summarize every stored invoice and its authorization status
    List,
    /// Drop cached access tickets
    ClearTickets {
        #[arg(long)]
        service: Option<String>,
    },
    /// Copy certificate and key PEM files into the OS keychain
    StoreCredentials {
        #[arg(long)]
        cert: PathBuf,
        #[arg(long)]
        key: PathBuf,
    },
    /// Remove certificate and key from the OS keychain
    ForgetCredentials,
    /// Write the active configuration to the config file
    InitConfig,
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

pub struct Clients {
    pub wsaa: Arc<WsaaClient>,
    pub wsfe: Arc<WsfeClient>,
}

fn create_clients(cfg: &AppConfig) -> anyhow::Result<Clients> {
    let environment = Environment::from_production_flag(cfg.environment.production);

    let (transport, signer, cache_dir) = match cfg.provider.kind.as_str() {
        "afip" => {
            if cfg.issuer.cuit.trim().is_empty() {
                anyhow::bail!("issuer.cuit is not configured");
            }
            let identity = CertificateSource::from_config(cfg)
                .load()
                .context("Failed to load signing identity")?;
            let transport: Arc<dyn SoapTransport> =
                HttpSoapTransport::new(Duration::from_secs(cfg.network.timeout_secs))?;
            let signer: Arc<dyn Signer> = Arc::new(OpensslCmsSigner::new(
                cfg.network.signer_binary.clone(),
                identity,
            ));
            let dir = match environment {
                Environment::Production => "production",
                Environment::Homologation => "homologation",
            };
            tracing::info!(?environment, "Using AFIP web services");
            (transport, signer, cfg.cache.ticket_dir.join(dir))
        }
        _ => {
            tracing::info!("Using in-process mock authority");
            let transport: Arc<dyn SoapTransport> = Arc::new(MockAuthority::new());
            let signer: Arc<dyn Signer> = Arc::new(FixedSigner::default());
            (transport, signer, cfg.cache.ticket_dir.join("mock"))
        }
    };

    let tickets: Arc<dyn TicketStore> = Arc::new(FileTicketStore::new(cache_dir));
    let margin = chrono::Duration::seconds(cfg.cache.safety_margin_secs as i64);
    let wsaa = Arc::new(
        WsaaClient::new(
            environment.wsaa_url(),
            Arc::clone(&transport),
            signer,
            tickets,
        )
        .with_safety_margin(margin),
    );
    let wsfe = Arc::new(WsfeClient::new(
        environment.wsfe_url(),
        cfg.issuer.cuit.clone(),
        transport,
        wsaa.clone(),
    ));
    Ok(Clients { wsaa, wsfe })
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let cfg = config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Falling back to default configuration");
        AppConfig::default()
    });

    let output = match cli.command {
        Command::Dummy => commands::dummy(&create_clients(&cfg)?).await?,
        Command::PointsOfSale => commands::points_of_sale(&create_clients(&cfg)?).await?,
        Command::LastVoucher {
            point,
            voucher_type,
        } => commands::last_voucher(&create_clients(&cfg)?, point, voucher_type).await?,
        Command::Import { dir } => commands::import(&cfg, &dir)?,
        Command::Authorize { invoice_id } => {
            let (output, code) =
                commands::authorize(&cfg, &create_clients(&cfg)?, &invoice_id).await?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            return Ok(code);
        }
        Command::Show { invoice_id } => commands::show(&cfg, &invoice_id)?,
        Command::List => commands::list(&cfg)?,
        Command::ClearTickets { service } => {
            commands::clear_tickets(&create_clients(&cfg)?, service.as_deref()).await?
        }
        Command::StoreCredentials { cert, key } => commands::store_credentials(&cert, &key)?,
        Command::ForgetCredentials => commands::forget_credentials()?,
        Command::InitConfig => commands::init_config(&cfg)?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Command failed");
            println!("{}", commands::error_json(&err));
            ExitCode::FAILURE
        }
    }
}
