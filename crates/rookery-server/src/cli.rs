use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "rookery-server", about = "Rookery federated room server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/rookery.toml")]
    pub config: String,

    /// Log as JSON lines instead of human-readable text
    #[arg(long)]
    pub json_logs: bool,
}
