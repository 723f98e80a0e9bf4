use anyhow::{Context, Result, bail};
use evcm::bridge;
use evcm::config::{AppConfig, config_schema};
use evcm::logging::init_logging;
use std::path::PathBuf;
use tokio::io::BufReader;
use tracing::{error, info};

const USAGE: &str = "usage: evcm [--config <path>] [--print-schema] [--version]";

struct Args {
    config: Option<PathBuf>,
    print_schema: bool,
}

fn parse_args() -> Result<Option<Args>> {
    let mut args = Args {
        config: None,
        print_schema: false,
    };
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = it.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--print-schema" => args.print_schema = true,
            "--version" | "-V" => {
                println!("evcm {}", env!("APP_VERSION"));
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(None);
            }
            other => bail!("unknown argument {other}\n{USAGE}"),
        }
    }
    Ok(Some(args))
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(args) = parse_args()? else {
        return Ok(());
    };

    if args.print_schema {
        println!("{}", serde_json::to_string_pretty(&config_schema())?);
        return Ok(());
    }

    let config = AppConfig::load(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {e}"))?;
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to init logging: {e}"))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    info!(
        version = env!("APP_VERSION"),
        chargers = config.chargers.len(),
        "evcm starting up"
    );

    let stop = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    match bridge::serve(
        &config,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        stop,
    )
    .await
    {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Bridge failed with error: {}", e);
            Err(anyhow::anyhow!("Bridge error: {}", e))
        }
    }
}
