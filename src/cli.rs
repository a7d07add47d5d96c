use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "modbot",
    version,
    about = "Scheduled moderation and summary bot for one subreddit"
)]
pub struct Cli {
    /// Bot configuration file. Built-in defaults are used when the default path is absent.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one pass over the subreddit and exit.
    Run(RunArgs),
    /// Print totals from the state store as JSON.
    Stats,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Evaluate and log intents without generating text or acting.
    #[arg(long)]
    pub dry_run: bool,
}

pub const DEFAULT_CONFIG_PATH: &str = "modbot.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::parse_from(["modbot", "run", "--dry-run", "--config", "bot.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("bot.toml")));
        assert!(!cli.log_json);
        assert!(matches!(cli.command, Command::Run(RunArgs { dry_run: true })));
    }

    #[test]
    fn test_parse_stats() {
        let cli = Cli::parse_from(["modbot", "--log-json", "stats"]);
        assert!(cli.log_json);
        assert!(matches!(cli.command, Command::Stats));
    }
}
