use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use paas_controller::application_types::*;
use paas_controller::config::{ControllerConfig, RunArgs};
use paas_controller::controller;

#[derive(Parser)]
#[command(name = "paas-controller")]
#[command(about = "Converges Applications into Deployments, Services and Ingresses", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level, used when RUST_LOG is unset
    #[arg(long, global = true, env = "PAAS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true, env = "PAAS_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the custom resource definitions as YAML
    Export,
    /// Run the Application and ApplicationConfig controllers
    Run(RunArgs),
}

fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.clone().into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    match cli.command {
        Command::Export => {
            info!("exporting custom resource definitions");
            println!("{}", serde_yaml::to_string(&Application::crd())?);
            println!("---");
            println!("{}", serde_yaml::to_string(&ApplicationConfig::crd())?);
            println!("---");
            println!("{}", serde_yaml::to_string(&ApplicationRevision::crd())?);
        }
        Command::Run(args) => {
            let config = ControllerConfig::from(args);
            let client = Client::try_default().await?;
            controller::run(client, config).await;
        }
    }
    Ok(())
}
