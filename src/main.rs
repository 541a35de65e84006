use clap::Parser;
use rampart_core::config::Config;

mod cli;
mod commands;

fn setup_logger() -> eyre::Result<()> {
    use tracing::Level;
    use tracing_subscriber::{
        filter::LevelFilter, fmt::layer, layer::SubscriberExt, util::SubscriberInitExt, Registry,
    };

    Registry::default()
        .with(LevelFilter::from(Level::INFO))
        .with(layer().with_ansi(true).with_target(false).without_time())
        .try_init()?;
    Ok(())
}

async fn load_config(args: &cli::Cli) -> eyre::Result<Config> {
    match &args.config_string {
        Some(config_string) => Ok(Config::parse(config_string)?),
        None => Ok(Config::parse_file(&args.config_file).await?),
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    setup_logger()?;
    let args = cli::Cli::parse();
    let mut config = load_config(&args).await?;
    if let Some(environment) = &args.environment {
        config.environment = environment.clone();
    }

    let exit_code = match args.subcommand {
        cli::Cmd::Backup(args) => commands::backup(&config, args).await?,
        cli::Cmd::Restore(args) => commands::restore(&config, args).await?,
        cli::Cmd::Test(args) => commands::test(&config, args).await?,
        cli::Cmd::Config => {
            commands::config(&config)?;
            0
        }
        cli::Cmd::Version => {
            commands::version(&config).await?;
            0
        }
    };
    std::process::exit(exit_code);
}
