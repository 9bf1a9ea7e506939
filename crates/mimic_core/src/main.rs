use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use mimic_core::{
    SettingsStore, Supervisor, DEFAULT_EGRESS_ADDR, DEFAULT_INSPECTOR_ADDR, DEFAULT_INTERCEPT_ADDR,
};
use mimic_net::CertificateAuthority;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "TLS fingerprint capturing and replaying proxy")]
struct Args {
    /// Intercept proxy address to listen on ([ip]:port)
    #[arg(long, default_value = DEFAULT_INTERCEPT_ADDR)]
    intercept: String,

    /// Inspecting proxy the intercept side forwards to (ip:port)
    #[arg(long, default_value = DEFAULT_INSPECTOR_ADDR)]
    burp: String,

    /// Egress listener address ([ip]:port)
    #[arg(long, default_value = DEFAULT_EGRESS_ADDR)]
    spoof: String,

    /// JSON file holding the saved transport settings; watched for edits
    #[arg(long)]
    settings: Option<PathBuf>,

    /// PEM certificate of the interception CA
    #[arg(long, requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// PEM private key of the interception CA
    #[arg(long, requires = "ca_cert")]
    ca_key: Option<PathBuf>,

    /// Where to write the certificate of a freshly generated CA
    #[arg(long, default_value = "mimic-ca.pem")]
    ca_out: PathBuf,

    /// Log to a daily rolling file in this directory instead of stdout
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn load_ca(args: &Args) -> anyhow::Result<CertificateAuthority> {
    if let (Some(cert), Some(key)) = (&args.ca_cert, &args.ca_key) {
        let ca = CertificateAuthority::load(cert, key)
            .with_context(|| format!("loading CA from {}", cert.display()))?;
        tracing::info!(cert = %cert.display(), "using existing CA");
        return Ok(ca);
    }

    let ca = CertificateAuthority::generate()?;
    ca.write_cert(&args.ca_out)
        .with_context(|| format!("writing CA certificate to {}", args.ca_out.display()))?;
    tracing::info!(
        cert = %args.ca_out.display(),
        "generated ephemeral CA, trust this certificate in the client"
    );
    Ok(ca)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _guard = match &args.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "mimic.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    };

    tracing::info!("Booting mimic...");

    match rlimit::increase_nofile_limit(u64::MAX) {
        Ok(limit) => tracing::debug!(limit, "raised open file limit"),
        Err(e) => tracing::warn!(error = %e, "could not raise open file limit"),
    }

    let settings = match &args.settings {
        Some(path) => SettingsStore::open(path)?,
        None => SettingsStore::in_memory(),
    };
    let ca = Arc::new(load_ca(&args)?);
    let supervisor = Supervisor::new(settings, ca);
    supervisor.watch_settings()?;

    supervisor.start(&args.intercept, &args.burp).await?;
    supervisor.start_egress(&args.spoof).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");
    supervisor.stop().await;

    tracing::info!("Shutdown complete.");
    Ok(())
}
