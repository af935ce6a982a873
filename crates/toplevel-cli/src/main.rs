//! Toplevel CLI - run one request against a toplevel worker.
//!
//! Connects to a worker over TCP or spawns one on stdio, performs the
//! readiness handshake and prints the result of a single request as JSON on
//! stdout. Incremental evaluation output is echoed to stderr as it arrives.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use toplevel_core::{
    Channel, ClientConfig, InitConfig, StreamChannel, WorkerClient, WorkerLocation,
};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "toplevel-cli")]
#[command(about = "Send requests to a toplevel worker")]
struct Args {
    /// Address of a worker listening on TCP
    #[arg(long, conflicts_with = "spawn")]
    connect: Option<SocketAddr>,

    /// Command line that starts a worker speaking on stdin/stdout
    #[arg(long)]
    spawn: Option<String>,

    /// Package to load during initialization (repeatable)
    #[arg(short, long = "require")]
    requires: Vec<String>,

    /// URL of the package index
    #[arg(long)]
    findlib_index: Option<String>,

    /// URL of the standard library's dynamic interface index
    #[arg(long)]
    stdlib_dcs: Option<String>,

    /// Request timeout in milliseconds
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Environment to run in; created before and destroyed after the request
    #[arg(long, default_value = ClientConfig::DEFAULT_ENV_ID)]
    env: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate a source file ("-" for stdin)
    Eval { source: PathBuf },
    /// Complete the identifier at a character offset
    Complete { source: PathBuf, offset: usize },
    /// Report the types enclosing a character offset
    Types { source: PathBuf, offset: usize },
    /// Report diagnostics without evaluating
    Errors { source: PathBuf },
    /// Resolve the worker script for a package index
    Locate {
        /// URL of the package index
        index_url: String,
        /// Base URL the worker builds are published under
        base_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries results.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    if let Commands::Locate {
        index_url,
        base_url,
    } = &args.command
    {
        let location = WorkerLocation::from_index(index_url, base_url).await?;
        println!("{}", location.worker_url);
        return Ok(());
    }

    let channel = open_channel(&args).await?;
    let client = WorkerClient::builder(channel)
        .request_timeout(Duration::from_millis(args.timeout_ms))
        .on_output_at(|out| eprint!("{}", out.caml_ppf))
        .build()?;

    client
        .initialize(init_config(&args))
        .await
        .context("worker initialization failed")?;
    info!("Worker ready");

    let result = run(&client, &args).await;

    client.terminate();
    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn open_channel(args: &Args) -> Result<Channel> {
    match (&args.connect, &args.spawn) {
        (Some(addr), _) => {
            info!("Connecting to worker at {}", addr);
            Ok(StreamChannel::connect_tcp(*addr).await?)
        }
        (None, Some(command_line)) => {
            let mut parts = command_line.split_whitespace();
            let program = parts.next().context("--spawn needs a command")?;
            let mut command = tokio::process::Command::new(program);
            command.args(parts);
            info!("Spawning worker: {}", command_line);
            Ok(StreamChannel::spawn(command)?)
        }
        (None, None) => bail!("either --connect or --spawn is required"),
    }
}

fn init_config(args: &Args) -> InitConfig {
    let mut config = args
        .requires
        .iter()
        .fold(InitConfig::new(), |config, package| config.require(package.as_str()));
    if let Some(url) = &args.findlib_index {
        config = config.with_findlib_index(url.as_str());
    }
    if let Some(url) = &args.stdlib_dcs {
        config = config.with_stdlib_dcs(url.as_str());
    }
    config
}

async fn run(client: &WorkerClient, args: &Args) -> Result<serde_json::Value> {
    let env = args.env.as_str();
    let scoped = env != ClientConfig::DEFAULT_ENV_ID;
    if scoped {
        client.create_environment(env).await?;
        debug!("Created environment {}", env);
    }

    let value = match &args.command {
        Commands::Eval { source } => {
            let code = read_source(source).await?;
            serde_json::to_value(client.evaluate(&code, env).await?)?
        }
        Commands::Complete { source, offset } => {
            let code = read_source(source).await?;
            serde_json::to_value(client.complete(&code, *offset, env).await?)?
        }
        Commands::Types { source, offset } => {
            let code = read_source(source).await?;
            serde_json::to_value(client.query_types(&code, *offset, env).await?)?
        }
        Commands::Errors { source } => {
            let code = read_source(source).await?;
            serde_json::to_value(client.query_errors(&code, env).await?)?
        }
        Commands::Locate { .. } => bail!("locate does not talk to a worker"),
    };

    if scoped {
        client.destroy_environment(env).await?;
        debug!("Destroyed environment {}", env);
    }
    Ok(value)
}

async fn read_source(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut code = String::new();
        tokio::io::stdin().read_to_string(&mut code).await?;
        return Ok(code);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}
