//! Routing-key grammar and well-known exchange names.
//!
//! Keys are `<kind>.<domain>.<action>` with kind one of `command`,
//! `response`, `event`. Domain and action are single words: non-empty, no
//! dots, no `*`/`#` wildcards, no whitespace.

use std::fmt;

use crate::errors::{GatewayError, Result};

/// Topic exchange carrying commands to workers.
pub const COMMANDS_EXCHANGE: &str = "commands";
/// Topic exchange carrying responses, events and system notifications.
pub const EVENTS_EXCHANGE: &str = "events";
/// Routing key for operator escalations.
pub const ADMIN_NOTIFICATION_KEY: &str = "system.notification.admins";

/// First word of a routing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RoutingKind {
    /// Worker-bound command.
    Command,
    /// Answer to a command.
    Response,
    /// Fan-out event.
    Event,
}

impl RoutingKind {
    /// Key prefix word.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Response => "response",
            Self::Event => "event",
        }
    }

    fn parse(word: &str) -> Option<Self> {
        match word {
            "command" => Some(Self::Command),
            "response" => Some(Self::Response),
            "event" => Some(Self::Event),
            _ => None,
        }
    }
}

/// Validated `<kind>.<domain>.<action>` key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    kind: RoutingKind,
    domain: String,
    action: String,
}

impl RoutingKey {
    /// Build a key, validating both words.
    pub fn new(kind: RoutingKind, domain: &str, action: &str) -> Result<Self> {
        validate_word("domain", domain)?;
        validate_word("action", action)?;
        Ok(Self {
            kind,
            domain: domain.to_owned(),
            action: action.to_owned(),
        })
    }

    /// `command.<domain>.<action>`.
    pub fn command(domain: &str, action: &str) -> Result<Self> {
        Self::new(RoutingKind::Command, domain, action)
    }

    /// `response.<domain>.<action>`.
    pub fn response(domain: &str, action: &str) -> Result<Self> {
        Self::new(RoutingKind::Response, domain, action)
    }

    /// Parse a full three-word key.
    pub fn parse(key: &str) -> Result<Self> {
        let mut words = key.split('.');
        let (Some(kind), Some(domain), Some(action), None) =
            (words.next(), words.next(), words.next(), words.next())
        else {
            return Err(GatewayError::invalid_params(format!(
                "routing key '{key}' must have exactly three words"
            )));
        };
        let kind = RoutingKind::parse(kind)
            .ok_or_else(|| GatewayError::invalid_params(format!("unknown routing kind '{kind}'")))?;
        Self::new(kind, domain, action)
    }

    /// Kind word.
    pub fn kind(&self) -> RoutingKind {
        self.kind
    }

    /// Domain word.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Action word.
    pub fn action(&self) -> &str {
        &self.action
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.kind.as_str(), self.domain, self.action)
    }
}

fn validate_word(what: &str, word: &str) -> Result<()> {
    if word.is_empty() {
        return Err(GatewayError::invalid_params(format!("{what} must not be empty")));
    }
    if word
        .chars()
        .any(|c| c == '.' || c == '*' || c == '#' || c.is_whitespace())
    {
        return Err(GatewayError::invalid_params(format!(
            "{what} '{word}' must be a single routing word"
        )));
    }
    Ok(())
}
