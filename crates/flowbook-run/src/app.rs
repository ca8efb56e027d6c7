use std::io::IsTerminal;
use std::path::PathBuf;

use clap::Parser;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "flowbook-run", about = "Run a Flowbook workflow from the terminal")]
pub struct Args {
    /// Path to a workflow file (YAML or JSON)
    pub workflow: PathBuf,

    /// Config file to use instead of the default location
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base URL of the Flowbook API
    #[arg(long)]
    pub api_url: Option<String>,

    /// Start right after this block, e.g. the checkpoint a previous run paused at
    #[arg(long, conflicts_with = "block")]
    pub start_after: Option<Uuid>,

    /// Run only this block
    #[arg(long)]
    pub block: Option<Uuid>,

    /// Run through checkpoints without stopping
    #[arg(long)]
    pub no_pause: bool,

    /// Exit once the blocks have run, leaving unfinished research jobs for the next run
    #[arg(long)]
    pub no_wait: bool,

    /// Save all results of finished research jobs into their blocks' output variables
    #[arg(long)]
    pub save_results: bool,

    /// Run the workflow non-interactively (auto-detected from TTY if not specified)
    #[arg(short, long)]
    pub non_interactive: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Determine if we should run in interactive mode
    ///
    /// Returns false (non-interactive) if:
    /// - --non-interactive flag is set
    /// - NO_TTY environment variable is set
    /// - CI environment variable is set
    /// - stdin is not a TTY
    pub fn is_interactive(&self) -> bool {
        if self.non_interactive {
            return false;
        }

        if std::env::var("NO_TTY").is_ok() || std::env::var("CI").is_ok() {
            return false;
        }

        // Resuming after a checkpoint reads from stdin
        std::io::stdin().is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resume_arguments() {
        let id = Uuid::new_v4();
        let args = Args::parse_from([
            "flowbook-run",
            "leads.yaml",
            "--start-after",
            &id.to_string(),
            "--no-pause",
            "-n",
        ]);
        assert_eq!(args.workflow, PathBuf::from("leads.yaml"));
        assert_eq!(args.start_after, Some(id));
        assert!(args.no_pause);
        assert!(!args.is_interactive());
    }

    #[test]
    fn test_parse_research_arguments() {
        let args = Args::parse_from(["flowbook-run", "leads.yaml", "--save-results"]);
        assert!(args.save_results);
        assert!(!args.no_wait);

        let args = Args::parse_from(["flowbook-run", "leads.yaml", "--no-wait"]);
        assert!(args.no_wait);
        assert!(!args.save_results);
    }

    #[test]
    fn test_block_conflicts_with_start_after() {
        let id = Uuid::new_v4().to_string();
        let parsed = Args::try_parse_from([
            "flowbook-run",
            "leads.yaml",
            "--start-after",
            &id,
            "--block",
            &id,
        ]);
        assert!(parsed.is_err());
    }
}
