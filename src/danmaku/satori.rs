//! Satori-style chat-bus upstream bridge: a JSON WebSocket event stream,
//! mapped through `group_map` into the gateway's channels. The exact wire
//! framing of a Satori-compatible bus is treated as an external protocol
//! this module does not own; it documents and implements the
//! minimal event shape it consumes.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::config::SatoriConfig;
use crate::emoji::EmojiCache;
use super::message::Message;
use super::parser::{DirectiveParser, Element, ParserOrigin};
use super::GatewayState;

/// One element of an inbound chat-bus message, mirroring Satori's own
/// element-array message content model.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireElement {
    Text { text: String },
    Image { url: String },
}

#[derive(Debug, Deserialize)]
struct ChatEvent {
    channel_id: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    user_name: Option<String>,
    elements: Vec<WireElement>,
}

fn to_elements(wire: Vec<WireElement>) -> Vec<Element> {
    wire.into_iter()
        .map(|e| match e {
            WireElement::Text { text } => Element::Text(text),
            WireElement::Image { url } => Element::Image { url },
        })
        .collect()
}

async fn handle_text_frame(
    text: &str,
    config: &SatoriConfig,
    gateway: &Arc<GatewayState>,
    emoji: &Arc<EmojiCache>,
) {
    let event: ChatEvent = match serde_json::from_str(text) {
        Ok(e) => e,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable satori event");
            return;
        }
    };

    let Some(channel) = config.group_map.get(&event.channel_id) else {
        debug!(source_channel = %event.channel_id, "no group mapping for satori channel, dropping");
        return;
    };

    let elements = to_elements(event.elements);
    let Some(mut msg) =
        DirectiveParser::parse(&elements, event.user_id, event.user_name, ParserOrigin::ChatBus)
    else {
        return;
    };

    if let Message::Emote { emote_key, sender_id, .. } = &mut msg {
        let user = sender_id.as_deref().unwrap_or("anonymous");
        match emoji.load_emoji(emote_key, user).await {
            Some(key) => *emote_key = key,
            None => {
                debug!(url = %emote_key, "dropping emote, failed to resolve through the emoji cache");
                return;
            }
        }
    }

    gateway.broadcast_message(channel, msg).await;
}

/// Connects to the configured chat bus and forwards events until the socket
/// closes, then reconnects after a short backoff. Runs forever.
pub async fn run(config: SatoriConfig, gateway: Arc<GatewayState>, emoji: Arc<EmojiCache>) {
    loop {
        let url = format!(
            "ws://{}:{}{}?token={}",
            config.host, config.port, config.path, config.token
        );
        match connect_async(&url).await {
            Ok((stream, _)) => {
                info!(host = %config.host, port = config.port, "connected to satori chat bus");
                let (mut sender, mut receiver) = stream.split();
                loop {
                    match receiver.next().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            handle_text_frame(&text, &config, &gateway, &emoji).await;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if sender.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            warn!("satori chat bus connection closed");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "satori chat bus websocket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to connect to satori chat bus");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_only_event() {
        let json = r#"{"channel_id":"src1","user_id":"1","user_name":"alice","elements":[{"type":"text","text":"hi"}]}"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.channel_id, "src1");
        assert_eq!(to_elements(event.elements), vec![Element::Text("hi".into())]);
    }

    #[test]
    fn parses_image_event() {
        let json = r#"{"channel_id":"src1","elements":[{"type":"image","url":"https://x/y.png"}]}"#;
        let event: ChatEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            to_elements(event.elements),
            vec![Element::Image { url: "https://x/y.png".into() }]
        );
    }
}
