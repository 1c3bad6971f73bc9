use std::process::ExitCode;

use clap::{Parser, Subcommand};
use libmaprfs::config::PLUGIN_LOG_FILE;
use libmaprfs::{Driver, DriverReply, Layout, Operation};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maprfs")]
#[command(about = "Kubernetes flex-volume driver for MapR-FS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Prepare the node, reclaiming stale mounts on fresh install")]
    Init,
    #[command(about = "Attach a volume using ./maprfs mount <target> <json-options>")]
    Mount {
        #[arg(value_name = "TARGET")]
        target: String,
        #[arg(value_name = "JSON_OPTIONS")]
        options: String,
    },
    #[command(about = "Detach a volume using ./maprfs unmount <target>")]
    Unmount {
        #[arg(value_name = "TARGET")]
        target: String,
    },
    // attach, detach, waitforattach, ... are answered with "Not supported".
    #[command(external_subcommand)]
    Other(Vec<String>),
}

impl From<Commands> for Operation {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Init => Operation::Init,
            Commands::Mount { target, options } => Operation::Mount { target, options },
            Commands::Unmount { target } => Operation::Unmount { target },
            Commands::Other(args) => Operation::from_args(&args),
        }
    }
}

fn log_appender(layout: &Layout) -> Result<RollingFileAppender, String> {
    std::fs::create_dir_all(&layout.log_dir).map_err(|e| e.to_string())?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(PLUGIN_LOG_FILE)
        .build(&layout.log_dir)
        .map_err(|e| e.to_string())
}

/// Log to `{logDir}/plugin-k8s.log`.  Stdout is reserved for the reply, so
/// when the log file is unusable events go to stderr instead.
fn init_logging(layout: &Layout) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_appender(layout) {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(error) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            tracing::warn!(path = %layout.plugin_log().display(), %error, "cannot open plugin log");
            None
        }
    }
}

fn run(layout: Layout, op: Operation) -> DriverReply {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => return DriverReply::failure(format!("cannot start runtime: {e}")),
    };
    runtime.block_on(Driver::for_node(layout).handle(op))
}

fn main() -> ExitCode {
    let layout = Layout::from_env();
    let _guard = init_logging(&layout);

    // The orchestrator treats any output other than a reply as a failure,
    // so argument errors are answered like unknown operations.
    let op = match Cli::try_parse() {
        Ok(cli) => Operation::from(cli.command),
        Err(e) => {
            tracing::info!(kind = ?e.kind(), "unrecognised invocation");
            let args: Vec<String> = std::env::args().skip(1).collect();
            Operation::from_args(&args)
        }
    };
    tracing::info!(?op, "plugin invoked");

    let reply = run(layout, op);
    println!("{}", reply.to_json());
    ExitCode::from(reply.exit_code())
}
