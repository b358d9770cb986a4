//! CLI flags for the auto-play driver, mirroring the original auto-play
//! script's flat argparse surface one for one.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "storyforge")]
#[command(about = "Auto-play driver for the storyforge narrative engine", long_about = None)]
#[command(version)]
pub struct Args {
    /// Root directory holding `data/` and `story_design/`. Defaults to the
    /// current directory.
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Story to play. Created with the default scaffolding if it doesn't
    /// exist yet.
    #[arg(long, default_value = "story_original")]
    pub story_id: String,

    /// Branch to fork the auto-play run from.
    #[arg(long, default_value = "main")]
    pub parent_branch: String,

    /// Message index on the parent branch to fork at (0 = fresh start).
    #[arg(long, default_value_t = 0)]
    pub branch_point: i64,

    /// Fork from the parent branch's state instead of starting blank.
    #[arg(long)]
    pub no_blank: bool,

    /// Path to a character JSON file (either a flat `CharacterState` object
    /// or `{character_state, personality, opening_message}`).
    #[arg(long)]
    pub character: Option<PathBuf>,

    /// Player-AI personality guidance, overriding the character file's.
    #[arg(long)]
    pub personality: Option<String>,

    /// Opening message for the first turn, overriding the character file's.
    #[arg(long)]
    pub opening: Option<String>,

    /// Maximum number of turns to run.
    #[arg(long, default_value_t = 200)]
    pub max_turns: u32,

    /// Maximum number of dungeons to clear before stopping. Unset = unlimited.
    #[arg(long)]
    pub max_dungeons: Option<u32>,

    /// Hub turns before nudging the player AI toward the next dungeon.
    #[arg(long, default_value_t = 10)]
    pub max_hub_turns: u32,

    /// Seconds to sleep between turns.
    #[arg(long, default_value_t = 3.0)]
    pub turn_delay: f64,

    /// Keep IMG prompts in the logged transcript instead of stripping them.
    /// Image generation itself stays fire-and-forget either way (§4.7) -
    /// this only affects what the auto-play transcript shows.
    #[arg(long)]
    pub with_images: bool,

    /// Resume a previous auto-play run instead of starting a new branch.
    #[arg(long)]
    pub resume: bool,

    /// Branch ID to resume. Required with `--resume`.
    #[arg(long)]
    pub branch_id: Option<String>,

    /// Override the LLM provider. No concrete adapter ships with this
    /// workspace (see `storyforge-providers`), so setting this only logs a
    /// warning - it does not select between providers.
    #[arg(long, value_parser = ["gemini", "claude_cli"])]
    pub provider: Option<String>,

    /// Max consecutive turn errors before the run stops itself.
    #[arg(long, default_value_t = 10)]
    pub max_errors: u32,

    /// Disable the web-search enrichment step before each GM call.
    #[arg(long)]
    pub no_web_search: bool,

    /// Log level (trace/debug/info/warn/error). Falls back to `RUST_LOG`
    /// when unset.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory for rolling log files. Defaults to `<root>/logs`.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Args {
    pub fn validate(&self) -> Result<(), String> {
        if self.resume && self.branch_id.is_none() {
            return Err("--branch-id is required with --resume".to_string());
        }
        Ok(())
    }
}
