// The UKAI core service daemon.
// Run: ukaid -c /etc/ukai/config

use std::env;
use std::sync::Arc;
use ukai::directory::{MetadataDirectory, RpcDirectory};
use ukai::types::UKAI_CONFIG_FILE_DEFAULT;
use ukai::{CoreServer, UkaiConfig, UkaiCore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config_file = UKAI_CONFIG_FILE_DEFAULT.to_string();
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                config_file = args
                    .next()
                    .ok_or("missing configuration file after -c")?;
            }
            "-h" | "--help" => {
                eprintln!("Usage: ukaid [-c CONFIG]");
                eprintln!("\t-c CONFIG: configuration file (default {})", UKAI_CONFIG_FILE_DEFAULT);
                return Ok(());
            }
            other => {
                eprintln!("unknown argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    let config = UkaiConfig::load(&config_file)?;
    let directory = Arc::new(RpcDirectory::from_config(&config)?);
    // The directory is the source of all metadata; refusing to start
    // without it beats serving a node that cannot open anything.
    directory.list_images().await?;

    let core = UkaiCore::new(config, directory);
    let server = CoreServer::start(core).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");
    server.stop().await;
    Ok(())
}
