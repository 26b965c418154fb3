use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = machinist_cli::Cli::parse();
    machinist_cli::run_cli(cli)
}
