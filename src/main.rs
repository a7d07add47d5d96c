mod cli;

use anyhow::Context;
use bot_service::{Orchestrator, RunNotifier};
use clap::Parser;
use cli::{Cli, Command, RunArgs, DEFAULT_CONFIG_PATH};
use database::Database;
use llm_interface::LlmClient;
use modbot_core::{BotConfig, ErrorExt, RedditCredentials};
use reddit_client::RedditClient;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "modbot=info,bot_service=info,reddit_client=info";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("modbot failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let store = open_store(&config).await?;

    match cli.command {
        Command::Run(args) => run(config, store, args).await,
        Command::Stats => {
            let stats = store.get_stats().await.context("reading stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BotConfig> {
    let config = match path {
        Some(path) => BotConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => BotConfig::load(DEFAULT_CONFIG_PATH),
        None => {
            tracing::info!("No {} found, using built-in defaults", DEFAULT_CONFIG_PATH);
            let config = BotConfig::default();
            config.validate().map(|()| config)
        }
    };
    config.map_err(|e| {
        e.log_error();
        anyhow::Error::new(e).context("invalid configuration")
    })
}

async fn open_store(config: &BotConfig) -> anyhow::Result<Database> {
    let mut store = Database::new(config.database_url.clone());
    store
        .connect()
        .await
        .with_context(|| format!("opening {}", config.database_url))?;
    store.run_migrations().await.context("migrating state store")?;
    Ok(store)
}

async fn run(config: BotConfig, store: Database, args: RunArgs) -> anyhow::Result<()> {
    let credentials = RedditCredentials::from_env().context("reading Reddit credentials")?;
    let platform = RedditClient::new(&config, credentials)?;
    let generator = LlmClient::from_config(&config).context("configuring text generation")?;
    let notifier = RunNotifier::from_settings(&config.notify)?;
    tracing::info!(
        "Using {} model {} for r/{}",
        generator.provider_name(),
        config.llm.model,
        config.subreddit
    );

    let bot = Orchestrator::new(config, platform, generator, notifier, store)
        .with_dry_run(args.dry_run);
    let result = bot.run_once().await;
    bot.platform().log_usage().await;
    let summary = result?;

    if summary.has_errors() {
        tracing::warn!("Run {} finished with {} errors", summary.run_id, summary.errors.len());
    }
    Ok(())
}
