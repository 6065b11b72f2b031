use clap::{Args, Command, FromArgMatches, Parser, Subcommand, ValueEnum};
use queue::TaskKind;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "feed-harvester")]
#[command(author = "CharaTech")]
#[command(version)]
#[command(about = "Resumable reference harvester for infinite-scroll feeds", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Queue file holding settings, pending and completed tasks
    #[arg(short, long, global = true, env = "FEED_HARVESTER_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Run browser in headless mode
    #[arg(long)]
    pub headless: bool,

    /// Stop after this many tasks
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Username for the site login
    #[arg(long, env = "FEED_HARVESTER_USERNAME")]
    pub username: Option<String>,

    /// Password for the site login
    #[arg(long, env = "FEED_HARVESTER_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Do not log in even if credentials are configured
    #[arg(long)]
    pub skip_login: bool,

    /// Hide the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Process pending tasks (default)
    Run(RunArgs),

    /// Add tasks to the pending set
    Add {
        /// Entry point for the new tasks
        #[arg(short, long, value_enum, default_value = "search")]
        kind: KindArg,

        /// Search keywords or user handles
        #[arg(value_name = "QUERY", required = true)]
        queries: Vec<String>,
    },

    /// Show pending and completed tasks
    Status,

    /// Move completed tasks back to pending
    Retry {
        #[arg(value_name = "QUERY", required = true)]
        queries: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Keyword search results
    Search,
    /// A user's feed
    UserFeed,
}

impl From<KindArg> for TaskKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Search => TaskKind::Search,
            KindArg::UserFeed => TaskKind::UserFeed,
        }
    }
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The chosen command. A bare invocation means `run` with its
    /// arguments taken from the environment.
    pub fn command_or_run(&self) -> Result<Commands, clap::Error> {
        match &self.command {
            Some(command) => Ok(command.clone()),
            None => RunArgs::from_env().map(Commands::Run),
        }
    }
}

impl RunArgs {
    /// `run` arguments with nothing on the command line, so env-backed
    /// flags still apply.
    pub fn from_env() -> Result<Self, clap::Error> {
        let matches = RunArgs::augment_args(Command::new("run")).try_get_matches_from(["run"])?;
        RunArgs::from_arg_matches(&matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_no_command() {
        let cli = Cli::try_parse_from(["feed-harvester"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, PathBuf::from("config.json"));
    }

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "feed-harvester",
            "--config",
            "jobs.json",
            "run",
            "--headless",
            "--limit",
            "5",
            "--skip-login",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("jobs.json"));
        match cli.command {
            Some(Commands::Run(args)) => {
                assert!(args.headless);
                assert!(args.skip_login);
                assert_eq!(args.limit, Some(5));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_add_kinds() {
        let cli = Cli::try_parse_from(["feed-harvester", "add", "--kind", "user-feed", "alice", "bob"])
            .unwrap();
        match cli.command {
            Some(Commands::Add { kind, queries }) => {
                assert_eq!(TaskKind::from(kind), TaskKind::UserFeed);
                assert_eq!(queries, vec!["alice", "bob"]);
            }
            other => panic!("unexpected command {:?}", other),
        }

        assert!(Cli::try_parse_from(["feed-harvester", "add"]).is_err());
        assert!(Cli::try_parse_from(["feed-harvester", "add", "--kind", "podcast", "x"]).is_err());
    }

    #[test]
    fn test_bare_invocation_reads_credentials_from_env() {
        std::env::set_var("FEED_HARVESTER_USERNAME", "envuser");

        let bare = Cli::try_parse_from(["feed-harvester"]).unwrap();
        let explicit = Cli::try_parse_from(["feed-harvester", "run"]).unwrap();

        match (bare.command_or_run().unwrap(), explicit.command_or_run().unwrap()) {
            (Commands::Run(bare), Commands::Run(explicit)) => {
                assert_eq!(bare.username.as_deref(), Some("envuser"));
                assert_eq!(bare.username, explicit.username);
                assert!(!bare.headless);
                assert_eq!(bare.limit, None);
            }
            other => panic!("unexpected commands {:?}", other),
        }

        std::env::remove_var("FEED_HARVESTER_USERNAME");
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Cli::try_parse_from(["feed-harvester", "-v", "-q", "status"]).is_err());
    }
}
