//! Artifactory build service command line.

use artifactory::artifact::{BuildOutcome, RequestArtifact};
use artifactory::config::Config;
use artifactory::{open_store, ArtifactService, Error};
use clap::{Args, Parser, Subcommand};
use log::{debug, error, info};
use serde::Serialize;

/// Request container image builds and track their artifacts.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults to `artifactory.toml` if it exists.
    #[arg(long)]
    config: Option<String>,

    /// Password for the container registry API.
    #[arg(long, env = "ARTIFACTORY_REGISTRY_PASSWORD", hide_env_values = true)]
    registry_password: Option<String>,

    /// Password embedded in git clone URLs.
    #[arg(long, env = "ARTIFACTORY_GIT_PASSWORD", hide_env_values = true)]
    git_password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create an artifact and dispatch its build. Waits until the build is handed to CI.
    Create(RequestArgs),
    /// List artifacts, newest first.
    List {
        /// Only artifacts whose application name contains this text.
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long, default_value_t = 1)]
        page: u64,
        /// 0 lists every match.
        #[arg(long, default_value_t = 20)]
        page_size: u64,
    },
    /// Show a single artifact.
    Get { uuid: String },
    /// Replace the request fields of an artifact.
    Update {
        uuid: String,
        #[command(flatten)]
        request: RequestArgs,
    },
    /// Delete an artifact. Unknown artifacts are ignored.
    Delete { uuid: String },
    /// List the remote branches of a repository, e.g. `git.example.com/team/app.git`.
    Branches { git_path: String },
    /// Print the highest build sequence number of an application.
    AppNumber { app_name: String },
    /// Record the final CI result of a building artifact.
    Report {
        uuid: String,
        /// `succeeded` or `failed`.
        outcome: BuildOutcome,
    },
}

#[derive(Args, Debug)]
struct RequestArgs {
    #[arg(long)]
    git_url: String,
    #[arg(long)]
    registry: String,
    #[arg(long)]
    app_name: String,
    #[arg(long)]
    branch: String,
    /// Image tag. A random one is generated when omitted.
    #[arg(long)]
    tag: Option<String>,
    #[arg(long, default_value = "")]
    remarks: String,
    #[arg(long, default_value = "")]
    language: String,
    #[arg(long, default_value = "Dockerfile")]
    project_file: String,
    #[arg(long, default_value = ".")]
    project_path: String,
}

impl From<RequestArgs> for RequestArtifact {
    fn from(args: RequestArgs) -> Self {
        Self {
            git_url: args.git_url,
            registry: args.registry,
            app_name: args.app_name,
            branch: args.branch,
            tag: args.tag,
            remarks: args.remarks,
            language: args.language,
            project_file: args.project_file,
            project_path: args.project_path,
        }
    }
}

#[derive(Serialize)]
struct Page<T> {
    items: Vec<T>,
    count: u64,
}

/// Read configuration file from disk and merge it with the
/// `default.toml` [built-in config](../default.toml).
///
/// If a configuration file name is not set explicitly, a file with the
/// default name in the working directory is used when it exists.
fn read_config(args: &Cli) -> Result<Config, Error> {
    const DEFAULT_CONFIG_FILE: &str = "artifactory.toml";

    let config_file = match &args.config {
        Some(path) => Some(path.clone()),
        None => std::fs::metadata(DEFAULT_CONFIG_FILE)
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
            .then(|| DEFAULT_CONFIG_FILE.to_string()),
    };

    let mut config = match config_file {
        Some(path) => {
            debug!("reading configuration from {path}");
            Config::default_with_user_config_file(&path)?
        }
        None => Config::default(),
    };

    if let Some(password) = &args.registry_password {
        config.registry.password = password.clone();
    }
    if let Some(password) = &args.git_password {
        config.git.password = password.clone();
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(_) => std::process::exit(0),
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(1)
        }
    }
}

async fn run() -> Result<(), Error> {
    env_logger::init();

    let args = Cli::parse();
    let config = read_config(&args)?;
    let store = open_store(&config).await?;
    let (service, worker) = ArtifactService::start(&config, store)?;

    match args.command {
        Commands::Create(request) => {
            let artifact = service.create(request.into()).await?;
            print_json(&artifact)?;
            info!("waiting for the build of {} to be dispatched", artifact.uuid());
            // the worker drains its queue once the service is gone
            drop(service);
            worker.join().await;
        }
        Commands::List { name, page, page_size } => {
            let (items, count) = service.list(&name, page, page_size).await?;
            print_json(&Page { items, count })?;
        }
        Commands::Get { uuid } => print_json(&service.get_by_uuid(&uuid).await?)?,
        Commands::Update { uuid, request } => print_json(&service.update(&uuid, request.into()).await?)?,
        Commands::Delete { uuid } => {
            service.delete(&uuid).await?;
            info!("deleted artifact {uuid}");
        }
        Commands::Branches { git_path } => print_json(&service.branches(&git_path).await?)?,
        Commands::AppNumber { app_name } => print_json(&service.app_number(&app_name).await)?,
        Commands::Report { uuid, outcome } => print_json(&service.record_outcome(&uuid, outcome).await?)?,
    }
    Ok(())
}
