use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use nekocast_danmaku::config::{load_config, DEFAULT_CONFIG_PATH};
use nekocast_danmaku::danmaku::{bilibili, satori, GatewayState};
use nekocast_danmaku::emoji::EmojiCache;
use nekocast_danmaku::webui;
use tracing_subscriber::fmt;

fn init_logger() {
    tracing_subscriber::fmt()
        .with_timer(fmt::time::ChronoLocal::new("%H:%M:%S".to_string()))
        .with_target(true)
        .with_span_events(fmt::format::FmtSpan::NONE)
        .with_writer(std::io::stdout)
        .with_max_level(tracing::Level::INFO)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = Command::new("nekocast-danmaku")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Danmaku overlay gateway: upstream bridges in, filtered WebSocket fan-out out")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("path to config.json")
                .default_value(DEFAULT_CONFIG_PATH.to_str().expect("config path is valid utf-8")),
        )
        .get_matches();

    init_logger();

    let config_path = PathBuf::from(matches.get_one::<String>("config").expect("has a default"));
    let config = load_config(&config_path);

    let gateway = match GatewayState::from_config(&config.danmaku) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway, exiting");
            std::process::exit(1);
        }
    };

    let http = reqwest::Client::new();
    let emoji = Arc::new(EmojiCache::new(http));

    {
        let emoji = emoji.clone();
        tokio::spawn(async move { emoji.run_maintenance_loop().await });
    }

    if let Some(bilibili_config) = config.danmaku.bilibili.clone() {
        let gateway = gateway.clone();
        tokio::spawn(async move { bilibili::run(bilibili_config, gateway).await });
    }

    if let Some(satori_config) = config.danmaku.satori.clone() {
        let gateway = gateway.clone();
        let emoji = emoji.clone();
        tokio::spawn(async move { satori::run(satori_config, gateway, emoji).await });
    }

    let state = webui::AppState {
        gateway: gateway.clone(),
        emoji,
        upstream_token: config.danmaku.upstream.as_ref().map(|u| u.token.clone()),
    };

    webui::serve(&config, state).await?;

    match Arc::try_unwrap(gateway) {
        Ok(mut gateway) => gateway.shutdown().await,
        Err(gateway) => {
            tracing::warn!("gateway still has outstanding references at shutdown");
            gateway.connections.disconnect_all().await;
        }
    }

    Ok(())
}
