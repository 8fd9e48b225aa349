pub mod config;
pub mod danmaku;
pub mod emoji;
pub mod webui;

pub use config::{load_config, AppConfig};
pub use danmaku::GatewayState;
