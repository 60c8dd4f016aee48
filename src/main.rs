use std::error::Error;

use clap::Parser;
use clap_derive::Parser;
use tracing_subscriber::EnvFilter;

use caravan::{api, config::Config, state::HubState, CONFIG_VERSION};

#[derive(Parser, Debug)]
#[command(author, version, about = "camper telemetry hub", long_about = None)]
struct Args {
    /// path to the RON config file
    #[arg(short, long, default_value = "./config.ron")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let cfg = Config::from_file(&args.config)?;
    if cfg.version != CONFIG_VERSION {
        panic!(
            "Wrong config version. Got {}, expected {}.",
            cfg.version, CONFIG_VERSION
        );
    }

    let api_listen = cfg.api_listen.clone();
    let state = HubState::init(cfg).await?;
    api::init(state, &api_listen).await?;

    Ok(())
}
