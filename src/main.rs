use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use omnihistory::{
    config::Config,
    logging,
    model::{App, RequestDetail},
    storage::Storage,
};

#[derive(Debug, Parser)]
#[command(name = "omnihistory")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the capture HTTP server.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override `[server].listen`.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Override `[storage].path`.
        #[arg(long)]
        db: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Manage applications.
    App {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override `[storage].path`.
        #[arg(long)]
        db: Option<PathBuf>,
        #[command(subcommand)]
        action: AppCommand,
    },
    /// Inspect captured requests.
    Request {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override `[storage].path`.
        #[arg(long)]
        db: Option<PathBuf>,
        #[command(subcommand)]
        action: RequestCommand,
    },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum AppCommand {
    /// Register an application code.
    Create { code: String, name: String },
    /// Show one application.
    Show { code: String },
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum RequestCommand {
    /// Show a captured request with its parameters.
    Show { id: i64 },
    /// Show the most recently captured request.
    Latest {
        /// Only consider requests from this session.
        #[arg(long)]
        session_id: Option<i64>,
    },
    /// Recompute the query and form parameters of a request.
    Populate { id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandOutcome {
    AppCreated(App),
    AppShown(App),
    RequestShown(Box<RequestDetail>),
    RequestRepopulated(Box<RequestDetail>),
}

fn load_config(config: Option<&Path>, db: Option<&Path>) -> anyhow::Result<Config> {
    let mut config = Config::load(config)?;
    config.apply_overrides(None, db);
    Ok(config)
}

async fn run_app_command(config: &Config, command: AppCommand) -> anyhow::Result<CommandOutcome> {
    let storage = Storage::from_config(config)?;

    match command {
        AppCommand::Create { code, name } => {
            let app = storage
                .create_app(&code, &name)
                .await
                .with_context(|| format!("failed to create app `{code}`"))?;
            Ok(CommandOutcome::AppCreated(app))
        }
        AppCommand::Show { code } => {
            let app = storage
                .get_app_by_code(&code)
                .await?
                .ok_or_else(|| anyhow::anyhow!("app `{code}` was not found"))?;
            Ok(CommandOutcome::AppShown(app))
        }
    }
}

async fn run_request_command(
    config: &Config,
    command: RequestCommand,
) -> anyhow::Result<CommandOutcome> {
    let storage = Storage::from_config(config)?;

    match command {
        RequestCommand::Show { id } => {
            let detail = storage
                .get_request(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("request {id} was not found"))?;
            Ok(CommandOutcome::RequestShown(Box::new(detail)))
        }
        RequestCommand::Latest { session_id } => {
            let latest = storage
                .latest_request(session_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no requests captured yet"))?;
            let detail = storage
                .get_request(latest.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("request {} was not found", latest.id))?;
            Ok(CommandOutcome::RequestShown(Box::new(detail)))
        }
        RequestCommand::Populate { id } => {
            let detail = storage
                .repopulate_request(id)
                .await
                .with_context(|| format!("failed to repopulate request {id}"))?;
            Ok(CommandOutcome::RequestRepopulated(Box::new(detail)))
        }
    }
}

fn describe_request(detail: &RequestDetail) -> String {
    let request = &detail.request;
    let mut lines = vec![
        format!("#{} {request}", request.id),
        format!(
            "  {} {}://{}{}",
            request.method(),
            request.protocol().map(|protocol| protocol.as_str()).unwrap_or("-"),
            request.host(),
            request.path()
        ),
        format!("  user-agent: {}", request.user_agent()),
    ];
    if !detail.query_params.is_empty() {
        lines.push(format!("  query: {}", detail.query_params.to_url_encoded()));
    }
    if !detail.form_params.is_empty() {
        lines.push(format!("  form: {}", detail.form_params.to_url_encoded()));
    }
    lines.join("\n")
}

fn print_command_outcome(outcome: CommandOutcome) {
    match outcome {
        CommandOutcome::AppCreated(app) => {
            println!("created app `{}` ({app})", app.code);
        }
        CommandOutcome::AppShown(app) => {
            println!("{} {app}", app.code);
        }
        CommandOutcome::RequestShown(detail) => {
            println!("{}", describe_request(&detail));
        }
        CommandOutcome::RequestRepopulated(detail) => {
            println!("repopulated request {}", detail.request.id);
            println!("{}", describe_request(&detail));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            listen,
            db,
            log_level,
        } => {
            let mut config = Config::load(config.as_deref())?;
            config.apply_overrides(listen, db.as_deref());
            logging::init(&config, log_level.as_deref())?;
            let server = omnihistory::server::serve(&config).await?;
            eprintln!("{}", startup_summary(&config, server.listen_addr));
            tokio::signal::ctrl_c().await?;
            server.shutdown().await;
        }
        Command::App { config, db, action } => {
            let config = load_config(config.as_deref(), db.as_deref())?;
            let outcome = run_app_command(&config, action).await?;
            print_command_outcome(outcome);
        }
        Command::Request { config, db, action } => {
            let config = load_config(config.as_deref(), db.as_deref())?;
            let outcome = run_request_command(&config, action).await?;
            print_command_outcome(outcome);
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, listen_addr: SocketAddr) -> String {
    let config_path = config
        .source_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());

    format!(
        "startup config: listen={}, storage_path={}, config={}",
        listen_addr,
        config.storage.path.display(),
        config_path
    )
}
