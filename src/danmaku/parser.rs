//! Directive parser: turns an upstream element list into a [`Message`].

use lazy_static::lazy_static;
use regex::Regex;

use super::message::{Message, Position};

/// One element of an upstream's raw payload: either text or an image
/// reference. Upstream-specific wire framing is normalized to this shape
/// before it reaches the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Text(String),
    Image { url: String },
}

/// Which upstream produced the element list being parsed. Governs whether
/// the trailing `#RRGGBB` suffix rule applies unconditionally (chat-bus
/// adapters) or only as part of the ordinary prefix/suffix directive rule
/// (everything else), resolved as a config flag on the adapter rather than
/// a guess at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserOrigin {
    Native,
    ChatBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Plain,
    Emote,
    Superchat,
    Gift,
}

lazy_static! {
    static ref SC_PATTERN: Regex =
        Regex::new(r"(?i)^/sc(?:\s+(?P<duration>\d+))?\s+(?P<text>.+)$").unwrap();
    static ref GIFT_PATTERN: Regex =
        Regex::new(r"(?i)^/gift\s+(?P<gift_name>.+?)(?:\s+(?P<quantity>\d+))?\s*$").unwrap();
    static ref POSITION_TOP: Regex = Regex::new(r"(?i)^/置顶$").unwrap();
    static ref POSITION_BOTTOM: Regex = Regex::new(r"(?i)^/置底$").unwrap();
    static ref COLOR_TOKEN: Regex = Regex::new(r"(?i)^#[0-9a-f]{3}([0-9a-f]{3})?$").unwrap();
    static ref TRAILING_COLOR: Regex = Regex::new(r"(?i)\s+(#[0-9a-f]{3}([0-9a-f]{3})?)$").unwrap();
}

/// Classifies an element list and constructs the corresponding [`Message`]
/// variant.
pub struct DirectiveParser;

impl DirectiveParser {
    /// Classification rules, first match wins.
    fn classify(elements: &[Element]) -> Option<Classification> {
        let first = elements.first()?;
        match first {
            Element::Image { .. } => {
                if elements.len() != 1 {
                    None
                } else {
                    Some(Classification::Emote)
                }
            }
            Element::Text(_) => {
                if !elements.iter().all(|e| matches!(e, Element::Text(_))) {
                    return None;
                }
                let joined = elements
                    .iter()
                    .map(|e| match e {
                        Element::Text(t) => t.as_str(),
                        Element::Image { .. } => unreachable!(),
                    })
                    .collect::<String>()
                    .to_lowercase();
                if SC_PATTERN.is_match(&joined) {
                    Some(Classification::Superchat)
                } else if GIFT_PATTERN.is_match(&joined) {
                    Some(Classification::Gift)
                } else {
                    Some(Classification::Plain)
                }
            }
        }
    }

    /// Builds a [`Message`] from an upstream element list, or `None` if the
    /// element list cannot be classified.
    pub fn parse(
        elements: &[Element],
        sender_id: Option<String>,
        sender_name: Option<String>,
        origin: ParserOrigin,
    ) -> Option<Message> {
        match Self::classify(elements)? {
            Classification::Emote => {
                let url = match &elements[0] {
                    Element::Image { url } => url.clone(),
                    Element::Text(_) => unreachable!(),
                };
                // Emotes are resolved against the cache by key elsewhere;
                // the raw URL travels as a placeholder key until then.
                Some(Message::Emote {
                    emote_key: url,
                    sender_id,
                    sender_name,
                    is_special: false,
                })
            }
            Classification::Superchat => {
                let text = concat_text(elements);
                match parse_superchat(&text) {
                    Some((duration_seconds, body)) => Some(Message::Superchat {
                        text: body,
                        duration_seconds,
                        cost_cents: 0,
                        sender_id,
                        sender_name,
                        is_special: false,
                    }),
                    None => Some(Self::plain_fallback(text, sender_id, sender_name)),
                }
            }
            Classification::Gift => {
                let text = concat_text(elements);
                match parse_gift(&text) {
                    Some((gift_name, quantity)) => Some(Message::Gift {
                        gift_name,
                        quantity,
                        cost_cents: 0,
                        sender_id,
                        sender_name,
                        is_special: false,
                    }),
                    None => Some(Self::plain_fallback(text, sender_id, sender_name)),
                }
            }
            Classification::Plain => {
                let text = concat_text(elements);
                Some(Self::parse_plain(text, sender_id, sender_name, origin))
            }
        }
    }

    fn plain_fallback(text: String, sender_id: Option<String>, sender_name: Option<String>) -> Message {
        Message::Plain {
            text,
            color: None,
            size: None,
            position: Position::default(),
            sender_id,
            sender_name,
            is_special: false,
        }
    }

    /// Parses plain-message directives: position and color tokens forming a
    /// contiguous prefix or suffix of the trimmed text.
    fn parse_plain(
        text: String,
        sender_id: Option<String>,
        sender_name: Option<String>,
        origin: ParserOrigin,
    ) -> Message {
        let trimmed = text.trim();

        let (body, position, color) = strip_directive_tokens(trimmed);

        // The Satori trailing-color suffix rule applies in addition to (and,
        // for chat-bus origin, ahead of) the inline token rule.
        let (body, color) = if origin == ParserOrigin::ChatBus && color.is_none() {
            if let Some(caps) = TRAILING_COLOR.captures(body) {
                let c = caps.get(1).unwrap().as_str().to_string();
                let stripped = TRAILING_COLOR.replace(body, "").trim().to_string();
                (stripped, Some(c))
            } else {
                (body.to_string(), color)
            }
        } else {
            (body.to_string(), color)
        };

        Message::Plain {
            text: if body.is_empty() { text.clone() } else { body },
            color,
            size: None,
            position,
            sender_id,
            sender_name,
            is_special: false,
        }
    }
}

fn concat_text(elements: &[Element]) -> String {
    elements
        .iter()
        .map(|e| match e {
            Element::Text(t) => t.as_str(),
            Element::Image { .. } => "",
        })
        .collect::<String>()
        .trim()
        .to_string()
}

fn parse_superchat(text: &str) -> Option<(u32, String)> {
    let caps = SC_PATTERN.captures(text)?;
    let duration = caps
        .name("duration")
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(10);
    let body = caps.name("text")?.as_str().to_string();
    Some((duration, body))
}

fn parse_gift(text: &str) -> Option<(String, u32)> {
    let caps = GIFT_PATTERN.captures(text)?;
    let name = caps.name("gift_name")?.as_str().trim().to_string();
    if name.is_empty() {
        return None;
    }
    let quantity = caps
        .name("quantity")
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(1);
    Some((name, quantity))
}

/// Strips a contiguous prefix or suffix of position/color directive tokens
/// from the trimmed input, returning the remaining body, the resolved
/// position, and the resolved color (if any). If tokens appear in the
/// interior, no stripping happens and the original text is returned with the
/// default position and no color.
fn strip_directive_tokens(trimmed: &str) -> (&str, Position, Option<String>) {
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens.is_empty() {
        return (trimmed, Position::default(), None);
    }

    let is_directive = |t: &str| POSITION_TOP.is_match(t) || POSITION_BOTTOM.is_match(t) || COLOR_TOKEN.is_match(t);

    let mut prefix_len = 0;
    for t in &tokens {
        if is_directive(t) {
            prefix_len += 1;
        } else {
            break;
        }
    }

    let mut suffix_len = 0;
    for t in tokens.iter().rev() {
        if is_directive(t) {
            suffix_len += 1;
        } else {
            break;
        }
    }

    // No directive tokens at all, or the whole message is directive tokens
    // with no text left to carry; a directive is only meaningful paired
    // with content.
    if prefix_len + suffix_len == 0 || prefix_len + suffix_len >= tokens.len() {
        return (trimmed, Position::default(), None);
    }

    // Directive tokens must not appear in the interior: every directive-like
    // token in the whole message must belong to the prefix or the suffix run.
    let directive_positions: Vec<usize> = tokens
        .iter()
        .enumerate()
        .filter(|(_, t)| is_directive(t))
        .map(|(i, _)| i)
        .collect();
    let n = tokens.len();
    let in_prefix_or_suffix = |i: usize| i < prefix_len || i >= n - suffix_len;
    if !directive_positions.iter().all(|&i| in_prefix_or_suffix(i)) {
        return (trimmed, Position::default(), None);
    }

    let body_tokens = &tokens[prefix_len..n - suffix_len];
    if body_tokens.is_empty() {
        return (trimmed, Position::default(), None);
    }

    let mut position = Position::default();
    let mut color = None;
    for t in tokens[..prefix_len].iter().chain(tokens[n - suffix_len..].iter()) {
        if POSITION_TOP.is_match(t) {
            position = Position::Top;
        } else if POSITION_BOTTOM.is_match(t) {
            position = Position::Bottom;
        } else if COLOR_TOKEN.is_match(t) {
            color = Some(t.to_string());
        }
    }

    let body_start = byte_offset_of_token(trimmed, &tokens, prefix_len);
    let body_end = byte_offset_of_token(trimmed, &tokens, n - suffix_len);
    let body = trimmed[body_start..body_end].trim();

    (body, position, color)
}

/// Returns the byte offset in `trimmed` where the `index`-th whitespace
/// token begins (or the string's length, if `index == tokens.len()`).
fn byte_offset_of_token(trimmed: &str, tokens: &[&str], index: usize) -> usize {
    if index == 0 {
        return 0;
    }
    if index == tokens.len() {
        return trimmed.len();
    }
    let target = tokens[index].as_ptr() as usize;
    target - trimmed.as_ptr() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Vec<Element> {
        vec![Element::Text(s.to_string())]
    }

    #[test]
    fn empty_element_list_classifies_to_none() {
        assert_eq!(
            DirectiveParser::parse(&[], None, None, ParserOrigin::Native),
            None
        );
    }

    #[test]
    fn single_image_is_emote() {
        let elements = vec![Element::Image {
            url: "https://x/y.png".into(),
        }];
        let msg = DirectiveParser::parse(&elements, None, None, ParserOrigin::Native).unwrap();
        assert!(matches!(msg, Message::Emote { .. }));
    }

    #[test]
    fn mixed_image_and_text_is_rejected() {
        let elements = vec![
            Element::Text("hi".into()),
            Element::Image {
                url: "https://x/y.png".into(),
            },
        ];
        assert_eq!(
            DirectiveParser::parse(&elements, None, None, ParserOrigin::Native),
            None
        );
    }

    #[test]
    fn plain_prefix_and_suffix_position_and_color_match() {
        let a = DirectiveParser::parse(&text("/置顶 #ff0000 hello"), None, None, ParserOrigin::Native)
            .unwrap();
        let b = DirectiveParser::parse(&text("hello /置顶 #ff0000"), None, None, ParserOrigin::Native)
            .unwrap();
        let expected = Message::Plain {
            text: "hello".into(),
            color: Some("#ff0000".into()),
            size: None,
            position: Position::Top,
            sender_id: None,
            sender_name: None,
            is_special: false,
        };
        assert_eq!(a, expected);
        assert_eq!(b, expected);
    }

    #[test]
    fn interior_directive_falls_back_to_bare_plain() {
        let msg = DirectiveParser::parse(&text("foo /置顶 bar"), None, None, ParserOrigin::Native)
            .unwrap();
        assert_eq!(
            msg,
            Message::Plain {
                text: "foo /置顶 bar".into(),
                color: None,
                size: None,
                position: Position::Scroll,
                sender_id: None,
                sender_name: None,
                is_special: false,
            }
        );
    }

    #[test]
    fn superchat_defaults_duration_to_10() {
        let msg = DirectiveParser::parse(&text("/sc hello there"), None, None, ParserOrigin::Native)
            .unwrap();
        assert_eq!(
            msg,
            Message::Superchat {
                text: "hello there".into(),
                duration_seconds: 10,
                cost_cents: 0,
                sender_id: None,
                sender_name: None,
                is_special: false,
            }
        );
    }

    #[test]
    fn superchat_with_explicit_duration() {
        let msg = DirectiveParser::parse(&text("/sc 30 hello"), None, None, ParserOrigin::Native)
            .unwrap();
        assert_eq!(
            msg,
            Message::Superchat {
                text: "hello".into(),
                duration_seconds: 30,
                cost_cents: 0,
                sender_id: None,
                sender_name: None,
                is_special: false,
            }
        );
    }

    #[test]
    fn gift_defaults_quantity_to_1() {
        let msg = DirectiveParser::parse(&text("/gift rose"), None, None, ParserOrigin::Native).unwrap();
        assert_eq!(
            msg,
            Message::Gift {
                gift_name: "rose".into(),
                quantity: 1,
                cost_cents: 0,
                sender_id: None,
                sender_name: None,
                is_special: false,
            }
        );
    }

    #[test]
    fn gift_with_explicit_quantity() {
        let msg = DirectiveParser::parse(&text("/gift rose 5"), None, None, ParserOrigin::Native).unwrap();
        assert_eq!(
            msg,
            Message::Gift {
                gift_name: "rose".into(),
                quantity: 5,
                cost_cents: 0,
                sender_id: None,
                sender_name: None,
                is_special: false,
            }
        );
    }

    #[test]
    fn trailing_color_suffix_honored_only_for_chat_bus_origin() {
        let via_chat_bus =
            DirectiveParser::parse(&text("hello #fff"), None, None, ParserOrigin::ChatBus).unwrap();
        assert_eq!(
            via_chat_bus,
            Message::Plain {
                text: "hello".into(),
                color: Some("#fff".into()),
                size: None,
                position: Position::Scroll,
                sender_id: None,
                sender_name: None,
                is_special: false,
            }
        );

        // Native origin still applies the ordinary suffix-token rule, which
        // also recognizes a trailing color token - so this example matches
        // either way, but a color in the interior (tested above) will not.
        let via_native =
            DirectiveParser::parse(&text("hello #fff"), None, None, ParserOrigin::Native).unwrap();
        assert_eq!(via_native, via_chat_bus);
    }
}
