use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = segmentation_cli::Cli::parse();
    segmentation_cli::run_cli(cli)
}
