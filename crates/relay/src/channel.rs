// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Channel identifiers and per-channel retention policy.
//!
//! Canonical string form is `scope:kind:id` (`agent:output:a1`,
//! `workspace:conflicts:w7`) or `scope:kind` for id-less streams
//! (`system:health`). Scopes are a closed set; kinds are free-form
//! `[a-z_]+` so producers can add streams without a broker change.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Channel scope. `system` channels never carry an id segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Agent,
    Workspace,
    User,
    System,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Workspace => "workspace",
            Self::User => "user",
            Self::System => "system",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "agent" => Some(Self::Agent),
            "workspace" => Some(Self::Workspace),
            "user" => Some(Self::User),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// A parsed, validated channel identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    scope: Scope,
    kind: String,
    id: Option<String>,
}

impl Channel {
    /// Parse a canonical channel string. Returns `None` for anything outside
    /// the grammar: `(agent|workspace|user):[a-z_]+(:[A-Za-z0-9_-]+)?` or
    /// `system:[a-z_]+`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let scope = Scope::parse(parts.next()?)?;
        let kind = parts.next()?;
        if kind.is_empty() || !kind.bytes().all(|b| b.is_ascii_lowercase() || b == b'_') {
            return None;
        }
        let id = match parts.next() {
            Some(id) => {
                if scope == Scope::System {
                    return None;
                }
                if id.is_empty()
                    || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
                {
                    return None;
                }
                Some(id.to_owned())
            }
            None => None,
        };
        Some(Self { scope, kind: kind.to_owned(), id })
    }

    pub fn new(scope: Scope, kind: impl Into<String>, id: Option<String>) -> Self {
        Self { scope, kind: kind.into(), id }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// The `scope:kind` prefix used for retention and ack-policy lookup.
    pub fn prefix(&self) -> String {
        format!("{}:{}", self.scope.as_str(), self.kind)
    }

    /// Canonical string form.
    pub fn canonical(&self) -> String {
        match &self.id {
            Some(id) => format!("{}:{}:{}", self.scope.as_str(), self.kind, id),
            None => self.prefix(),
        }
    }

    /// Extract the `scope:kind` prefix from an already-canonical string.
    pub fn prefix_of(canonical: &str) -> &str {
        match canonical.match_indices(':').nth(1) {
            Some((idx, _)) => &canonical[..idx],
            None => canonical,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

// -- Retention ----------------------------------------------------------------

/// Bounded-history parameters for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Retention {
    pub const fn new(capacity: usize, ttl: Duration) -> Self {
        Self { capacity, ttl }
    }
}

/// Retention defaults by channel prefix. Unknown prefixes fall back to
/// 1 000 entries / 5 minutes.
pub fn retention_for(prefix: &str) -> Retention {
    match prefix {
        "agent:output" => Retention::new(10_000, Duration::from_secs(5 * 60)),
        "agent:state" => Retention::new(100, Duration::from_secs(60 * 60)),
        "agent:tools" => Retention::new(500, Duration::from_secs(10 * 60)),
        "workspace:agents" => Retention::new(200, Duration::from_secs(30 * 60)),
        "workspace:reservations" => Retention::new(500, Duration::from_secs(30 * 60)),
        "workspace:conflicts" => Retention::new(500, Duration::from_secs(30 * 60)),
        "user:mail" => Retention::new(1_000, Duration::from_secs(24 * 60 * 60)),
        "user:notifications" => Retention::new(500, Duration::from_secs(60 * 60)),
        "system:health" => Retention::new(60, Duration::from_secs(60)),
        "system:metrics" => Retention::new(120, Duration::from_secs(2 * 60)),
        _ => Retention::new(1_000, Duration::from_secs(5 * 60)),
    }
}

// -- Ack policy ---------------------------------------------------------------

/// Channel prefixes whose messages must be explicitly acknowledged by each
/// subscriber. Held as data rather than a match so deployments (and tests)
/// can adjust membership.
#[derive(Debug, Clone)]
pub struct AckPolicy {
    prefixes: HashSet<String>,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self::new(["workspace:conflicts", "workspace:reservations", "user:notifications"])
    }
}

impl AckPolicy {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { prefixes: prefixes.into_iter().map(Into::into).collect() }
    }

    /// Whether messages on this channel require per-connection acks.
    pub fn requires_ack(&self, channel: &str) -> bool {
        self.prefixes.contains(Channel::prefix_of(channel))
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
