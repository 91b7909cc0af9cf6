use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "tessera-server", about = "Tessera message batching service")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tessera.toml")]
    pub config: String,
}
