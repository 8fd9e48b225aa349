//! The danmaku message and control envelopes.

use serde::{Deserialize, Serialize};

/// Where a plain-text message scrolls/sits on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Scroll,
    Top,
    Bottom,
}

impl Default for Position {
    fn default() -> Self {
        Position::Scroll
    }
}

/// A single normalized danmaku message, fanned out to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Plain {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        size: Option<u32>,
        #[serde(default)]
        position: Position,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default)]
        is_special: bool,
    },
    Emote {
        emote_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default)]
        is_special: bool,
    },
    Superchat {
        text: String,
        duration_seconds: u32,
        cost_cents: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default)]
        is_special: bool,
    },
    Gift {
        gift_name: String,
        quantity: u32,
        cost_cents: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_name: Option<String>,
        #[serde(default)]
        is_special: bool,
    },
}

impl Message {
    pub fn sender_id(&self) -> Option<&str> {
        match self {
            Message::Plain { sender_id, .. }
            | Message::Emote { sender_id, .. }
            | Message::Superchat { sender_id, .. }
            | Message::Gift { sender_id, .. } => sender_id.as_deref(),
        }
    }

    pub fn sender_name(&self) -> Option<&str> {
        match self {
            Message::Plain { sender_name, .. }
            | Message::Emote { sender_name, .. }
            | Message::Superchat { sender_name, .. }
            | Message::Gift { sender_name, .. } => sender_name.as_deref(),
        }
    }

    pub fn set_sender_name(&mut self, name: String) {
        match self {
            Message::Plain { sender_name, .. }
            | Message::Emote { sender_name, .. }
            | Message::Superchat { sender_name, .. }
            | Message::Gift { sender_name, .. } => *sender_name = Some(name),
        }
    }

    /// The text field used for blacklist matching and dedup keys, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            Message::Plain { text, .. } | Message::Superchat { text, .. } => Some(text.as_str()),
            Message::Emote { .. } | Message::Gift { .. } => None,
        }
    }

    pub fn is_special(&self) -> bool {
        match self {
            Message::Plain { is_special, .. }
            | Message::Emote { is_special, .. }
            | Message::Superchat { is_special, .. }
            | Message::Gift { is_special, .. } => *is_special,
        }
    }

    pub fn set_is_special(&mut self, value: bool) {
        match self {
            Message::Plain { is_special, .. }
            | Message::Emote { is_special, .. }
            | Message::Superchat { is_special, .. }
            | Message::Gift { is_special, .. } => *is_special = value,
        }
    }

    /// True for superchat/gift.
    pub fn is_monetary(&self) -> bool {
        matches!(self, Message::Superchat { .. } | Message::Gift { .. })
    }

    /// Appends the crown marker to the text field, if the variant carries one.
    pub fn append_crown(&mut self) {
        match self {
            Message::Plain { text, .. } | Message::Superchat { text, .. } => {
                text.push_str("👑");
            }
            Message::Emote { .. } | Message::Gift { .. } => {}
        }
    }
}

/// A control directive for the viewer overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Control {
    SetOpacity { value: f64 },
    ClearDanmaku {},
    PauseDanmaku { paused: bool },
    SetFontSize { size: i64 },
    HideDanmaku { hidden: bool },
}

impl Control {
    /// Clamps out-of-range numeric fields in place.
    pub fn clamp(&mut self) {
        match self {
            Control::SetOpacity { value } => {
                *value = value.clamp(0.0, 100.0);
            }
            Control::SetFontSize { size } => {
                *size = (*size).clamp(1, 100);
            }
            _ => {}
        }
    }
}

/// The envelope a control directive travels in on the viewer socket: `{"type":
/// "control", "control": <Control>}`.
#[derive(Debug, Clone, Serialize)]
pub struct ControlFrame<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub control: &'a Control,
}

impl<'a> ControlFrame<'a> {
    pub fn new(control: &'a Control) -> Self {
        ControlFrame { kind: "control", control }
    }
}

/// The packet a trusted upstream sends over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamPacket {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danmaku: Option<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control: Option<Control>,
}

/// Errors constructing or validating an [`UpstreamPacket`].
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet must include exactly one of danmaku or control, got {0}")]
    InvalidPayloadCount(&'static str),
}

impl UpstreamPacket {
    /// Enforces the "exactly one of the two payload fields" invariant.
    pub fn validate(&self) -> Result<(), PacketError> {
        match (&self.danmaku, &self.control) {
            (Some(_), Some(_)) => Err(PacketError::InvalidPayloadCount("both")),
            (None, None) => Err(PacketError::InvalidPayloadCount("neither")),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_round_trips_through_json() {
        let msg = Message::Plain {
            text: "hello".to_string(),
            color: Some("#ff0000".to_string()),
            size: None,
            position: Position::Top,
            sender_id: Some("1".to_string()),
            sender_name: Some("alice".to_string()),
            is_special: true,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn each_variant_round_trips() {
        let msgs = vec![
            Message::Plain {
                text: "hi".into(),
                color: None,
                size: None,
                position: Position::Scroll,
                sender_id: None,
                sender_name: None,
                is_special: false,
            },
            Message::Emote {
                emote_key: "deadbeef".into(),
                sender_id: None,
                sender_name: None,
                is_special: false,
            },
            Message::Superchat {
                text: "thanks".into(),
                duration_seconds: 10,
                cost_cents: 0,
                sender_id: None,
                sender_name: Some("badguy".into()),
                is_special: false,
            },
            Message::Gift {
                gift_name: "rose".into(),
                quantity: 3,
                cost_cents: 0,
                sender_id: None,
                sender_name: None,
                is_special: false,
            },
        ];
        for msg in msgs {
            let json = serde_json::to_string(&msg).unwrap();
            let back: Message = serde_json::from_str(&json).unwrap();
            assert_eq!(msg, back);
        }
    }

    #[test]
    fn crown_marker_only_applies_to_text_bearing_variants() {
        let mut emote = Message::Emote {
            emote_key: "k".into(),
            sender_id: None,
            sender_name: None,
            is_special: true,
        };
        emote.append_crown();
        assert_eq!(emote.text(), None);

        let mut plain = Message::Plain {
            text: "hi".into(),
            color: None,
            size: None,
            position: Position::Scroll,
            sender_id: None,
            sender_name: None,
            is_special: true,
        };
        plain.append_crown();
        assert_eq!(plain.text(), Some("hi👑"));
    }

    #[test]
    fn opacity_clamps_to_0_100() {
        let mut c = Control::SetOpacity { value: -5.0 };
        c.clamp();
        assert_eq!(c, Control::SetOpacity { value: 0.0 });

        let mut c = Control::SetOpacity { value: 150.0 };
        c.clamp();
        assert_eq!(c, Control::SetOpacity { value: 100.0 });
    }

    #[test]
    fn font_size_clamps_to_1_100() {
        let mut c = Control::SetFontSize { size: -3 };
        c.clamp();
        assert_eq!(c, Control::SetFontSize { size: 1 });

        let mut c = Control::SetFontSize { size: 500 };
        c.clamp();
        assert_eq!(c, Control::SetFontSize { size: 100 });
    }

    #[test]
    fn control_frame_wraps_the_discriminated_control() {
        let control = Control::SetOpacity { value: 50.0 };
        let frame = ControlFrame::new(&control);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "control");
        assert_eq!(json["control"]["type"], "set_opacity");
        assert_eq!(json["control"]["value"], 50.0);
    }

    #[test]
    fn packet_requires_exactly_one_payload() {
        let neither = UpstreamPacket {
            channel: "a".into(),
            danmaku: None,
            control: None,
        };
        assert!(neither.validate().is_err());

        let both = UpstreamPacket {
            channel: "a".into(),
            danmaku: Some(Message::Emote {
                emote_key: "k".into(),
                sender_id: None,
                sender_name: None,
                is_special: false,
            }),
            control: Some(Control::ClearDanmaku {}),
        };
        assert!(both.validate().is_err());
    }
}
