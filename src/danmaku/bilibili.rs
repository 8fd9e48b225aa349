//! Bilibili live-room upstream bridge: binary WebSocket danmaku protocol,
//! normalized into the gateway's `(channel, sender_id, display_name,
//! element_list)` message model. This module is the adapter that produces
//! that tuple stream for the Bilibili source.

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::ZlibDecoder;
use futures_util::{SinkExt, StreamExt};
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::config::BilibiliConfig;
use super::message::Message;
use super::parser::{DirectiveParser, Element, ParserOrigin};
use super::GatewayState;

// Acknowledgement: protocol framing follows the open Bilibili live danmaku
// WebSocket scheme (header layout, WBI signing) as widely documented in the
// Isoheptane/bilibili-live-danmaku-cli reference implementation.
const HEADER_LENGTH: u32 = 16;

const PROTOCOL_COMMAND: u16 = 0;
const PROTOCOL_COMMAND_ZLIB: u16 = 2;
const PROTOCOL_COMMAND_BROTLI: u16 = 3;

const OP_HEARTBEAT: u32 = 2;
const OP_HEARTBEAT_REPLY: u32 = 3;
const OP_MESSAGE: u32 = 5;
const OP_AUTH: u32 = 7;
const OP_AUTH_REPLY: u32 = 8;

const MIXIN_KEY_ENC_TAB: [u8; 64] = [
    46, 47, 18, 2, 53, 8, 23, 32, 15, 50, 10, 31, 58, 3, 45, 35, 27, 43, 5, 49, 33, 9, 42, 19, 29,
    28, 14, 39, 12, 38, 41, 13, 37, 48, 7, 16, 24, 55, 40, 61, 26, 17, 0, 1, 60, 51, 30, 4, 22, 25,
    54, 21, 56, 59, 6, 63, 57, 62, 11, 36, 20, 34, 44, 52,
];

fn gen_mixin_key(raw_wbi_key: &str) -> String {
    let raw_bytes = raw_wbi_key.as_bytes();
    MIXIN_KEY_ENC_TAB
        .iter()
        .take(32)
        .map(|&n| raw_bytes[n as usize] as char)
        .collect()
}

fn url_encode(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string().replace('+', "%20")
}

fn calculate_w_rid(params: &BTreeMap<&str, String>, mixin_key: &str) -> String {
    let encoded: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, url_encode(v))).collect();
    let string_to_hash = format!("{}{}", encoded.join("&"), mixin_key);
    let mut hasher = Md5::new();
    hasher.update(string_to_hash.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One authenticated room connection, bridging Bilibili's binary protocol
/// into `channel`'s message stream.
struct RoomConnection {
    room_id: u64,
    channel: String,
    sess_data: String,
    token: Option<String>,
    host_list: Vec<String>,
    gateway: Arc<GatewayState>,
}

impl RoomConnection {
    fn new(room_id: u64, channel: String, sess_data: String, gateway: Arc<GatewayState>) -> Self {
        RoomConnection {
            room_id,
            channel,
            sess_data,
            token: None,
            host_list: Vec::new(),
            gateway,
        }
    }

    async fn get_wbi_keys(&self) -> Result<(String, String)> {
        let client = reqwest::Client::new();
        let response: Value = client
            .get("https://api.bilibili.com/x/web-interface/nav")
            .send()
            .await?
            .json()
            .await?;

        let wbi_img = response["data"]["wbi_img"]
            .as_object()
            .ok_or_else(|| anyhow!("missing wbi_img in nav response"))?;
        let img_url = wbi_img["img_url"].as_str().ok_or_else(|| anyhow!("missing img_url"))?;
        let sub_url = wbi_img["sub_url"].as_str().ok_or_else(|| anyhow!("missing sub_url"))?;

        let extract = |url: &str| -> Result<String> {
            url.split('/')
                .last()
                .and_then(|s| s.split('.').next())
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid wbi key url: {url}"))
        };
        Ok((extract(img_url)?, extract(sub_url)?))
    }

    async fn get_danmaku_info(&mut self) -> Result<()> {
        let (img_key, sub_key) = self.get_wbi_keys().await?;
        let mixin_key = gen_mixin_key(&format!("{}{}", img_key, sub_key));

        let wts = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs().to_string();
        let mut params = BTreeMap::new();
        params.insert("id", self.room_id.to_string());
        params.insert("type", "0".to_string());
        params.insert("wts", wts.clone());
        let w_rid = calculate_w_rid(&params, &mixin_key);
        let query = format!("id={}&type=0&wts={}&w_rid={}", self.room_id, wts, w_rid);

        let client = reqwest::Client::new();
        let cookie = format!("SESSDATA={}", self.sess_data);
        let response: Value = client
            .get(format!(
                "https://api.live.bilibili.com/xlive/web-room/v1/index/getDanmuInfo?{}",
                query
            ))
            .header("Cookie", &cookie)
            .send()
            .await?
            .json()
            .await?;

        let code = response["code"].as_i64().unwrap_or(-1);
        if code != 0 {
            return Err(anyhow!(
                "getDanmuInfo failed: code {}, message {}",
                code,
                response["message"].as_str().unwrap_or("unknown")
            ));
        }

        let data = &response["data"];
        self.token = data["token"].as_str().map(str::to_string);
        self.host_list = data["host_list"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|h| h["host"].as_str().map(str::to_string))
            .collect();

        if self.host_list.is_empty() {
            return Err(anyhow!("no danmaku hosts returned"));
        }
        Ok(())
    }

    fn create_packet(&self, operation: u32, body: &[u8]) -> Result<Vec<u8>> {
        let mut packet = Vec::new();
        packet.write_u32::<BigEndian>(HEADER_LENGTH + body.len() as u32)?;
        packet.write_u16::<BigEndian>(HEADER_LENGTH as u16)?;
        packet.write_u16::<BigEndian>(PROTOCOL_COMMAND)?;
        packet.write_u32::<BigEndian>(operation)?;
        packet.write_u32::<BigEndian>(1)?;
        packet.extend_from_slice(body);
        Ok(packet)
    }

    fn create_auth_packet(&self) -> Result<Vec<u8>> {
        let auth = serde_json::json!({
            "uid": 0,
            "roomid": self.room_id,
            "protover": 2,
            "platform": "web",
            "type": 2,
            "key": self.token.as_deref().unwrap_or(""),
        });
        self.create_packet(OP_AUTH, &serde_json::to_vec(&auth)?)
    }

    async fn connect(&mut self) -> Result<()> {
        if let Err(e) = self.get_danmaku_info().await {
            warn!(room = self.room_id, error = %e, "failed to get danmaku info, using fallback host");
            self.host_list = vec!["broadcastlv.chat.bilibili.com".to_string()];
            self.token = Some(String::new());
        }

        let ws_url = format!("wss://{}/sub", self.host_list[0]);
        let (ws_stream, _) = connect_async(&ws_url).await?;
        let (mut sender, mut receiver) = ws_stream.split();

        sender.send(WsMessage::Binary(self.create_auth_packet()?)).await?;

        let heartbeat_packet = self.create_packet(OP_HEARTBEAT, &[])?;
        let mut heartbeat = interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                msg = receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Binary(data))) => {
                            if let Err(e) = self.handle_frame(&data).await {
                                error!(room = self.room_id, error = %e, "error handling bilibili frame");
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            warn!(room = self.room_id, "bilibili websocket closed");
                            break;
                        }
                        Some(Err(e)) => {
                            error!(room = self.room_id, error = %e, "bilibili websocket error");
                            break;
                        }
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = sender.send(WsMessage::Binary(heartbeat_packet.clone())).await {
                        error!(room = self.room_id, error = %e, "failed to send heartbeat");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_frame(&self, data: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new(data);
        while cursor.position() < data.len() as u64 {
            let packet_length = cursor.read_u32::<BigEndian>()?;
            let header_length = cursor.read_u16::<BigEndian>()?;
            let protocol_version = cursor.read_u16::<BigEndian>()?;
            let operation = cursor.read_u32::<BigEndian>()?;
            let _sequence = cursor.read_u32::<BigEndian>()?;

            let body_length = packet_length - header_length as u32;
            let mut body = vec![0u8; body_length as usize];
            cursor.read_exact(&mut body)?;

            match operation {
                OP_AUTH_REPLY => debug!(room = self.room_id, "bilibili auth accepted"),
                OP_HEARTBEAT_REPLY => {}
                OP_MESSAGE => self.handle_message_body(protocol_version, &body).await?,
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_message_body(&self, protocol_version: u16, body: &[u8]) -> Result<()> {
        match protocol_version {
            PROTOCOL_COMMAND_ZLIB => {
                let mut decoder = ZlibDecoder::new(body);
                let mut decompressed = Vec::new();
                decoder.read_to_end(&mut decompressed)?;
                Box::pin(self.handle_frame(&decompressed)).await
            }
            PROTOCOL_COMMAND_BROTLI => {
                debug!(room = self.room_id, "skipping brotli-compressed frame");
                Ok(())
            }
            _ => {
                if let Ok(text) = std::str::from_utf8(body) {
                    if let Ok(cmd) = serde_json::from_str::<Value>(text) {
                        self.dispatch_command(&cmd).await;
                    }
                }
                Ok(())
            }
        }
    }

    async fn dispatch_command(&self, cmd: &Value) {
        let Some(kind) = cmd["cmd"].as_str() else { return };
        match kind {
            "DANMU_MSG" => self.handle_danmu(cmd).await,
            "SUPER_CHAT_MESSAGE" | "SUPER_CHAT_MESSAGE_JP" => self.handle_superchat(cmd).await,
            "SEND_GIFT" => self.handle_gift(cmd).await,
            _ => {}
        }
    }

    async fn handle_danmu(&self, cmd: &Value) {
        let Some(info) = cmd["info"].as_array() else { return };
        if info.len() <= 2 {
            return;
        }
        let Some(text) = info[1].as_str() else { return };
        let user_info = info[2].as_array();
        let sender_id = user_info.and_then(|u| u.first()).and_then(|v| v.as_i64()).map(|id| id.to_string());
        let sender_name = user_info
            .and_then(|u| u.get(1))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let Some(mut msg) =
            DirectiveParser::parse(&[Element::Text(text.to_string())], sender_id, sender_name, ParserOrigin::Native)
        else {
            return;
        };
        msg.set_is_special(false);
        self.gateway.broadcast_message(&self.channel, msg).await;
    }

    async fn handle_superchat(&self, cmd: &Value) {
        let data = &cmd["data"];
        let text = data["message"].as_str().unwrap_or("").to_string();
        let duration_seconds = data["time"].as_u64().unwrap_or(10) as u32;
        let cost_cents = (data["price"].as_f64().unwrap_or(0.0) * 100.0).round() as u64;
        let sender_id = data["uid"].as_i64().map(|id| id.to_string());
        let sender_name = data["user_info"]["uname"].as_str().map(str::to_string);

        let msg = Message::Superchat {
            text,
            duration_seconds,
            cost_cents,
            sender_id,
            sender_name,
            is_special: false,
        };
        self.gateway.broadcast_message(&self.channel, msg).await;
    }

    async fn handle_gift(&self, cmd: &Value) {
        let data = &cmd["data"];
        let gift_name = data["giftName"].as_str().unwrap_or("gift").to_string();
        let quantity = data["num"].as_u64().unwrap_or(1) as u32;
        let cost_cents = (data["price"].as_u64().unwrap_or(0) * quantity as u64) / 10;
        let sender_id = data["uid"].as_i64().map(|id| id.to_string());
        let sender_name = data["uname"].as_str().map(str::to_string);

        info!(channel = %self.channel, gift = %gift_name, quantity, "received bilibili gift");
        let msg = Message::Gift {
            gift_name,
            quantity,
            cost_cents,
            sender_id,
            sender_name,
            is_special: false,
        };
        self.gateway.broadcast_message(&self.channel, msg).await;
    }
}

/// Runs one reconnecting bridge per configured room, forever. Each room's
/// task is independent: a failure on one room never affects another.
pub async fn run(config: BilibiliConfig, gateway: Arc<GatewayState>) {
    let mut handles = Vec::new();
    for (room_id_str, channel) in config.room_ids {
        let Ok(room_id) = room_id_str.parse::<u64>() else {
            warn!(room_id = %room_id_str, "skipping bilibili room with non-numeric id");
            continue;
        };
        let sess_data = config.sess_data.clone();
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            loop {
                let mut conn = RoomConnection::new(room_id, channel.clone(), sess_data.clone(), gateway.clone());
                if let Err(e) = conn.connect().await {
                    error!(room_id, error = %e, "bilibili bridge error");
                }
                info!(room_id, "reconnecting to bilibili in 5 seconds");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixin_key_uses_first_32_table_entries() {
        let raw = "a".repeat(64);
        let key = gen_mixin_key(&raw);
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c == 'a'));
    }

    #[test]
    fn w_rid_is_deterministic_for_same_input() {
        let mut params = BTreeMap::new();
        params.insert("id", "123".to_string());
        params.insert("wts", "456".to_string());
        let a = calculate_w_rid(&params, "mixinkey");
        let b = calculate_w_rid(&params, "mixinkey");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
