use crate::badge::BadgeBoard;
use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::settings::SettingsStore;
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "settings-get" {
            return handle_settings_get(&config).await;
        }
        if command == "settings-set" {
            return handle_settings_set(&config).await;
        }
    }

    let store = open_store(&config)?;
    let badges = BadgeBoard::new();
    let (coordinator, handle) = Coordinator::new(
        store.clone(),
        Arc::new(badges.clone()),
        Duration::from_millis(config.settings.write_debounce_ms),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let coordinator_task = tokio::spawn(coordinator.run(shutdown_rx.clone()));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;

    let token = match config.server.token {
        Some(token) => token,
        None => {
            let token = generate_token(32);
            tracing::info!("no server token configured, generated one for this run");
            token
        }
    };
    println!(
        "connect url: ws://{}/connect?token={}&name=<content|popup>",
        addr, token
    );

    let result = tokio::select! {
        res = crate::server::start(addr, token, handle, store, badges, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            Ok(())
        }
    };

    let _ = shutdown_tx.send(true);
    let _ = coordinator_task.await;
    result
}

fn open_store(config: &Config) -> Result<SettingsStore, Box<dyn std::error::Error>> {
    let path = config.settings.resolved_path();
    Ok(SettingsStore::open(
        Some(path.as_path()),
        config.settings.max_writes_per_minute,
    )?)
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_settings_get(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(config)?;
    match std::env::args().nth(2) {
        Some(key) => {
            let value = store.get(&key).await?.ok_or("missing settings key")?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        None => {
            println!("{}", serde_json::to_string_pretty(&store.get_all().await?)?);
        }
    }
    Ok(())
}

async fn handle_settings_set(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(2);
    let key = args.next().ok_or("missing key")?;
    let raw = args.next().ok_or("missing value")?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;

    let store = open_store(config)?;
    store.set(&key, value).await?;

    println!("Stored setting: {}", key);
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token(32));
    }
}
