use anyhow::Context;
use clap::Parser;
use live_serve::{
    cli,
    config::{CliArgs, ServerConfiguration},
    startup::{self, Application},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(args.log_filter()))
        .with_writer(std::io::stderr)
        .init();

    let directory = match args.directory() {
        Ok(directory) => directory,
        Err(error) => {
            cli::print_usage_error(&error, &cli::program_name());
            std::process::exit(1);
        }
    };

    let root = startup::enter_root(directory).context("failed to enter serving directory")?;
    let config = ServerConfiguration::builder(root).build();

    let app = Application::build(&config).await?;
    cli::print_startup_summary(&config, &app);
    if config.browser().open {
        cli::launch_browser(cli::open_url(&config, &app), config.browser().browser.clone());
    }
    app.run_until_stopped().await?;

    Ok(())
}
