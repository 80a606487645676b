//! IRC line parsing for the Twitch chat protocol.
//!
//! The parser is total: any line it does not recognize yields no event, and
//! malformed tag fragments or non-numeric counts fall back to safe defaults.
//! The receive loop has no way to recover from a parser panic mid-stream, so
//! nothing in here returns an error.

use std::collections::HashMap;

use chrono::Utc;

use super::types::{
    ChatEvent, ParsedEvent, RaidEvent, SubKind, SubscriptionEvent,
};

/// One raw protocol line split into its structural parts. Borrows from the
/// input line; nothing is allocated until an event is actually built.
#[derive(Debug, Default)]
pub struct IrcMessage<'a> {
    tags: Option<&'a str>,
    prefix: Option<&'a str>,
    command: Option<&'a str>,
    params: Vec<&'a str>,
}

impl<'a> IrcMessage<'a> {
    pub fn parse(line: &'a str) -> Self {
        let mut message = IrcMessage::default();
        let mut rest = line.trim_end_matches(['\r', '\n']);

        if let Some(after_at) = rest.strip_prefix('@') {
            match after_at.split_once(' ') {
                Some((tags, remainder)) => {
                    message.tags = Some(tags);
                    rest = remainder;
                }
                None => {
                    message.tags = Some(after_at);
                    return message;
                }
            }
        }

        if let Some(after_colon) = rest.strip_prefix(':') {
            match after_colon.split_once(' ') {
                Some((prefix, remainder)) => {
                    message.prefix = Some(prefix);
                    rest = remainder;
                }
                None => {
                    message.prefix = Some(after_colon);
                    return message;
                }
            }
        }

        let (head, trailing) = match rest.split_once(" :") {
            Some((head, trailing)) => (head, Some(trailing)),
            None => (rest, None),
        };
        let mut parts = head.split(' ').filter(|p| !p.is_empty());
        message.command = parts.next();
        message.params.extend(parts);
        if let Some(trailing) = trailing {
            message.params.push(trailing);
        }
        message
    }

    pub fn command(&self) -> Option<&'a str> {
        self.command
    }

    pub fn params(&self) -> &[&'a str] {
        &self.params
    }

    /// Nick portion of a `nick!user@host` prefix. Server prefixes (no `!`)
    /// yield `None`.
    pub fn prefix_nick(&self) -> Option<&'a str> {
        self.prefix
            .and_then(|p| p.split_once('!'))
            .map(|(nick, _)| nick)
    }

    /// Tag block as a map. Fragments without `=` are skipped; values may be
    /// empty strings.
    pub fn tags(&self) -> HashMap<&'a str, &'a str> {
        let mut map = HashMap::new();
        if let Some(tags) = self.tags {
            for fragment in tags.split(';') {
                if let Some((key, value)) = fragment.split_once('=') {
                    map.insert(key, value);
                }
            }
        }
        map
    }
}

/// Decodes one raw protocol line into at most one event. Server PING lines
/// are the transport's business and are not handled here.
pub fn parse_line(line: &str) -> Option<ParsedEvent> {
    let message = IrcMessage::parse(line);
    match message.command() {
        Some("PRIVMSG") => chat_event(&message),
        Some("USERNOTICE") => user_notice_event(&message),
        _ => None,
    }
}

fn channel_param<'a>(message: &IrcMessage<'a>) -> Option<&'a str> {
    message
        .params()
        .first()
        .map(|p| p.trim_start_matches('#'))
        .filter(|p| !p.is_empty())
}

fn chat_event(message: &IrcMessage<'_>) -> Option<ParsedEvent> {
    let username = message.prefix_nick()?;
    let channel = channel_param(message)?;
    // PRIVMSG without a trailing text param is not a chat message.
    let text = if message.params().len() > 1 {
        *message.params().last()?
    } else {
        return None;
    };

    let tags = message.tags();
    let badges = tags.get("badges").copied().unwrap_or("");
    Some(ParsedEvent::Chat(ChatEvent {
        username: username.to_string(),
        display_name: tags
            .get("display-name")
            .copied()
            .unwrap_or(username)
            .to_string(),
        text: text.to_string(),
        channel: channel.to_string(),
        user_id: tags.get("user-id").map(|v| v.to_string()),
        color: tags.get("color").copied().unwrap_or("#FFFFFF").to_string(),
        badges: badges.to_string(),
        is_subscriber: tags.get("subscriber").copied() == Some("1"),
        is_mod: tags.get("mod").copied() == Some("1"),
        is_vip: badges.contains("vip"),
        timestamp: Utc::now(),
    }))
}

fn user_notice_event(message: &IrcMessage<'_>) -> Option<ParsedEvent> {
    let channel = channel_param(message)?;
    let notice_text = if message.params().len() > 1 {
        message.params().last().copied().unwrap_or("")
    } else {
        ""
    };

    let tags = message.tags();
    let kind = match tags.get("msg-id").copied()? {
        "sub" => SubKind::Sub,
        "resub" => SubKind::Resub,
        "subgift" => SubKind::SubGift,
        "submysterygift" => SubKind::MysteryGift,
        "raid" => {
            return Some(ParsedEvent::Raid(RaidEvent {
                username: tags.get("msg-param-login").copied().unwrap_or("").to_string(),
                display_name: tags
                    .get("msg-param-displayName")
                    .copied()
                    .unwrap_or("")
                    .to_string(),
                viewer_count: numeric_tag(&tags, "msg-param-viewerCount"),
                channel: channel.to_string(),
                timestamp: Utc::now(),
            }));
        }
        // The protocol has many other notice kinds this system does not
        // care about (rituals, announcements, ...).
        _ => return None,
    };

    let (recipient, recipient_id) = if kind == SubKind::SubGift {
        (
            Some(
                tags.get("msg-param-recipient-display-name")
                    .copied()
                    .unwrap_or("")
                    .to_string(),
            ),
            Some(
                tags.get("msg-param-recipient-id")
                    .copied()
                    .unwrap_or("")
                    .to_string(),
            ),
        )
    } else {
        (None, None)
    };
    let gift_count = (kind == SubKind::MysteryGift)
        .then(|| numeric_tag(&tags, "msg-param-mass-gift-count"));

    Some(ParsedEvent::Subscription(SubscriptionEvent {
        kind,
        username: tags.get("login").copied().unwrap_or("").to_string(),
        display_name: tags.get("display-name").copied().unwrap_or("").to_string(),
        channel: channel.to_string(),
        message: notice_text.to_string(),
        months: numeric_tag(&tags, "msg-param-cumulative-months"),
        plan: tags.get("msg-param-sub-plan").copied().unwrap_or("").to_string(),
        recipient,
        recipient_id,
        gift_count,
        timestamp: Utc::now(),
    }))
}

fn numeric_tag(tags: &HashMap<&str, &str>, key: &str) -> u32 {
    tags.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}
