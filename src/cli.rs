use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "streamfan")]
#[command(version = "0.3.1")]
#[command(about = "Stream N concurrent text continuations of a prompt from a completion backend")]
pub struct Args {
    /// Writing prompt to fan out across the streams
    pub prompt: Option<String>,

    /// Number of concurrent streams
    #[arg(long, short, default_value = "4")]
    pub streams: usize,

    /// Token budget per generation (continuations use the configured larger budget)
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Completion backend URL (overrides config and environment)
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Snapshot database path (overrides config)
    #[arg(long)]
    pub store: Option<PathBuf>,

    /// Continue all streams from the persisted snapshot instead of starting fresh
    #[arg(long)]
    pub resume: bool,

    /// Print broadcast channel traffic alongside stream progress
    #[arg(long)]
    pub watch: bool,
}

impl Args {
    /// `--resume` needs no prompt; a fresh run does.
    pub fn validate(&self) -> Result<(), String> {
        if !self.resume && self.prompt.is_none() {
            return Err("a prompt is required unless --resume is given".to_string());
        }
        Ok(())
    }
}
