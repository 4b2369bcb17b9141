use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, Parser, Subcommand};
use sauber_devpi::{
    BootstrapConfig, DevpiCli, ServeArgs, badges, config::log_environment,
    launcher, provision, readiness::wait_for_server,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "sauber-devpi",
    version,
    about = "Start a devpi server and provision its users and indices"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Refresh version badges in a README
    Badges(BadgeArgs),
}

#[derive(Args)]
struct BadgeArgs {
    #[arg(long, default_value = "README.md")]
    readme: PathBuf,
    #[arg(long, env = "DEVPI_SERVER_BIN", default_value = "devpi-server")]
    server_bin: String,
    /// Client command line, e.g. `poetry run devpi`
    #[arg(long, env = "DEVPI_CLIENT", default_value = "devpi")]
    client: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // A missing .env is the normal case inside the container.
    if let Err(err) = dotenv
        && !err.not_found()
    {
        warn!(error = %err, "Failed to load .env file");
    }

    let cli = Cli::parse();

    match cli.command {
        Some(Command::Badges(args)) => run_badges(args).await,
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    log_environment(std::env::vars_os());
    let config =
        BootstrapConfig::from_args(args, |key| std::env::var(key).ok())
            .context("invalid configuration")?;

    let mut server = launcher::launch(&config.server)
        .await
        .context("failed to start devpi server")?;

    let http = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    if !wait_for_server(&http, &config.server_url, config.ready_timeout).await
    {
        error!("Exiting due to server readiness failure.");
        if let Err(err) = server.kill().await {
            warn!(error = %err, "failed to stop devpi server");
        }
        bail!(
            "server at {} did not become ready within {}",
            config.server_url,
            humantime::format_duration(config.ready_timeout)
        );
    }

    let client = DevpiCli::new(&config.client, http)
        .ok_or_else(|| anyhow!("client command line is empty"))?;
    let report = provision(
        &client,
        &config.server_url,
        &config.primary,
        &config.secondary,
    )
    .await;

    if let Some(failure) = report.failure {
        if config.strict_provisioning {
            if let Err(err) = server.kill().await {
                warn!(error = %err, "failed to stop devpi server");
            }
            return Err(failure).context("provisioning incomplete");
        }
        warn!(
            completed = report.completed.len(),
            "Provisioning incomplete; server keeps running with partial state"
        );
    }

    info!("devpi server running; waiting for it to exit");
    let status = server
        .wait()
        .await
        .context("failed to wait on devpi server")?;
    if !status.success() {
        bail!("devpi-server exited with {status}");
    }
    Ok(())
}

async fn run_badges(args: BadgeArgs) -> Result<()> {
    let badges =
        badges::collect_badges(&args.server_bin, &args.client).await;
    for badge in &badges {
        println!("{}", badge.markdown());
    }
    badges::update_readme(&args.readme, &badges).await?;
    println!(
        "{} has been updated with the latest badge URLs.",
        args.readme.display()
    );
    Ok(())
}
