use clap::Parser;
use eyre::Result;
use flowbook_runtime::config::RuntimeConfig;

use crate::{
    app::Args,
    executor::{Executor, RunSelection},
};

mod app;
mod executor;
mod workflows;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    flowbook_runtime::init_tracing_with_default(if args.verbose { "debug" } else { "info" });

    let file = workflows::load_workflow(&args.workflow).await?;

    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path).await?.with_env_overrides(),
        None => RuntimeConfig::load_default().await?,
    };
    if let Some(url) = &args.api_url {
        config.api_base_url = url.clone();
    }

    let selection = RunSelection {
        start_after: args.start_after,
        block: args.block,
        no_pause: args.no_pause,
        no_wait: args.no_wait,
        save_results: args.save_results,
    };
    let executor = Executor::new(file, config, selection, args.is_interactive());
    match executor.execute().await {
        Err(e) => Err(eyre::eyre!(e)),
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
    }
}
