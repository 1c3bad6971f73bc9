use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use libmaprfs::config::PROVISIONER_LOG_FILE;
use libmaprfs::provisioner::{PROVISIONER_NAME, RestClient};
use libmaprfs::secret::ServiceInfo;
use libmaprfs::{KubeSecretStore, Layout, MaprError, PersistentVolume, ProvisionRequest, Provisioner};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

#[derive(Parser)]
#[command(name = "maprfs-provisioner")]
#[command(about = "Creates and deletes MapR-FS volumes for persistent volume claims", long_about = None)]
struct Cli {
    /// API server URL; in-cluster discovery is used when absent.
    #[arg(long, env = "MAPRFS_MASTER")]
    master: Option<url::Url>,
    /// Bearer token for the API server.
    #[arg(long, value_name = "PATH", default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,
    /// Identity written to, and required on, every persistent volume.
    #[arg(long, default_value = PROVISIONER_NAME)]
    identity: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Create a volume for a claim using ./maprfs-provisioner provision --request claim.json")]
    Provision {
        #[arg(long, value_name = "REQUEST_JSON")]
        request: PathBuf,
    },
    #[command(about = "Delete the volume behind a persistent volume using ./maprfs-provisioner delete --volume pv.json")]
    Delete {
        #[arg(long, value_name = "PV_JSON")]
        volume: PathBuf,
    },
}

/// Log to `{logDir}/provisioner-k8s.log`.
fn init_logging(layout: &Layout) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&layout.log_dir)
        .with_context(|| format!("failed to create log dir {}", layout.log_dir.display()))?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(PROVISIONER_LOG_FILE)
        .build(&layout.log_dir)
        .context("failed to open provisioner log")?;
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(guard)
}

async fn secret_store(cli: &Cli) -> anyhow::Result<KubeSecretStore> {
    let store = match &cli.master {
        Some(master) => {
            info!(%master, "using configured API server");
            KubeSecretStore::with_token_file(master.clone(), &cli.token_file).await?
        }
        None => {
            let Some(service) = ServiceInfo::from_env() else {
                bail!("not running in a cluster and no --master given");
            };
            info!(api_server = %service, "using in-cluster API server");
            KubeSecretStore::with_service_account(&service).await?
        }
    };
    Ok(store)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    let layout = Layout::from_env();
    let _guard = init_logging(&layout)?;

    let provisioner = Provisioner::new(
        cli.identity.clone(),
        Box::new(secret_store(&cli).await?),
        RestClient::https()?,
    );

    match &cli.command {
        Commands::Provision { request } => {
            let request: ProvisionRequest = read_json(request)?;
            let pv = provisioner.provision(&request).await?;
            println!("{}", serde_json::to_string_pretty(&pv)?);
        }
        Commands::Delete { volume } => {
            let pv: PersistentVolume = read_json(volume)?;
            match provisioner.delete(&pv).await {
                Ok(()) => {}
                Err(MaprError::Ignored(reason)) => {
                    warn!(pv = %pv.metadata.name, %reason, "skipping volume");
                    eprintln!("{}: {reason}", pv.metadata.name);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}
