//! Auto-play driver binary: plays a story end to end with a scripted
//! player AI and no human in the loop, built on top of `storyforge-sdk`.

mod args;
mod autoplay;
mod logging;
mod provider;

use std::sync::Arc;

use clap::Parser;
use storyforge_providers::LlmProvider;
use storyforge_sdk::Client;

use args::Args;
use provider::PlaceholderProvider;
use storyforge_runtime::config::RuntimeConfig;

fn main() {
    #[cfg(unix)]
    reset_sigpipe();

    let args = Args::parse();
    if let Err(message) = args.validate() {
        eprintln!("Error: {message}");
        std::process::exit(1);
    }

    if let Err(err) = run(args) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let root = args.root.clone().unwrap_or_else(|| std::env::current_dir().expect("current dir"));
    logging::init(args.log_level.as_deref(), args.log_dir.as_deref(), &root)?;

    let config_path = root.join("storyforge.toml");
    let config = RuntimeConfig::load(config_path.exists().then_some(config_path.as_path()))?;

    let provider: Arc<dyn LlmProvider> = Arc::new(PlaceholderProvider::new());
    let client = Client::builder().root(root).provider(provider).config(config).build()?;

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(autoplay::run(args, client))
}

#[cfg(unix)]
fn reset_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}
