// FX Sniper - Real-time forex signal pipeline
// Ticks -> M1/M5/M15 candles -> pattern bank -> quality gate -> sweep guard -> published signals

pub mod core;
pub mod layer1;
pub mod layer2;
pub mod layer3;
pub mod engine;

use clap::Parser;

/// Command-line arguments for the `fx-sniper` binary
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON config file (missing file keeps defaults)
    #[arg(long, short)]
    pub config: Option<String>,

    /// Candle snapshot path, overrides `snapshot.path`
    #[arg(long)]
    pub snapshot: Option<String>,

    /// Log level, overrides `monitoring.log_level`
    #[arg(long)]
    pub log_level: Option<String>,
}
