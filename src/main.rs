use std::sync::Arc;

use clap::Parser;
use env_logger::Env;
use log::{error, info};

use chat_hub::auth::{token_digest, StaticTokens, TokenValidator};
use chat_hub::config::Config;
use chat_hub::error::ConfigError;
use chat_hub::server::{self, Server};
use chat_hub::store::{MemoryStore, Stores};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    if let Some(token) = &config.hash_token {
        println!("{}", token_digest(token));
        return;
    }

    if let Err(e) = run(config).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), ConfigError> {
    let entries = config.load_accounts()?;
    let tls = config
        .tls()?
        .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf()));
    info!("Loaded {} accounts", entries.len());

    let store = Arc::new(MemoryStore::with_accounts(
        entries.iter().map(|entry| entry.account.clone()),
    ));
    let validator: Arc<dyn TokenValidator> = Arc::new(StaticTokens::new(&entries));

    let listen = config.listen;
    let hub = Server::start(config, Stores::memory(store));
    let routes = server::routes(hub.clone(), validator);

    let signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    };

    match tls {
        Some((cert, key)) => {
            let (addr, serving) = warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .bind_with_graceful_shutdown(listen, signal);
            info!("Chat hub listening on wss://{}/chat", addr);
            serving.await;
        }
        None => {
            let (addr, serving) = warp::serve(routes).bind_with_graceful_shutdown(listen, signal);
            info!("Chat hub listening on ws://{}/chat", addr);
            serving.await;
        }
    }

    hub.shutdown().await;
    Ok(())
}
