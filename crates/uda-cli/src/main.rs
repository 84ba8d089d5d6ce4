use clap::Parser;
use uda_cli::{run_cli, Cli};
use uda_runtime::{init_logging, Settings};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    init_logging(&settings.log_filter, settings.log_format);
    run_cli(cli, settings)
}
