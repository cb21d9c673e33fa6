//! Server status carried in the console title.
//!
//! The server rewrites its title every frame with something like
//! `Northstar - mp_grave 3/16 players (private_match)`. Only titles of that shape
//! count as status updates; anything else is ordinary noise.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use tracing::warn;

/// Longest map or playlist name kept from a title.
pub const STATUS_NAME_MAX: usize = 31;

/// Structured status recovered from one title update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub map_name: String,
    pub playlist_name: String,
    pub player_count: u32,
    pub max_players: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusParseError {
    #[error("title does not contain a server status")]
    NoMatch,
    #[error("player count `{0}` is out of range")]
    Overflow(String),
}

fn status_regex() -> &'static Regex {
    static STATUS_RE: OnceLock<Regex> = OnceLock::new();
    STATUS_RE.get_or_init(|| {
        Regex::new(r" - ([A-Za-z0-9_]+) ([0-9]+)/([0-9]+)(?: players)? \(([A-Za-z0-9_]+)\)")
            .expect("status regex should compile")
    })
}

fn bounded_name(raw: &str) -> String {
    // names are ASCII by construction of the pattern
    raw.get(..STATUS_NAME_MAX).unwrap_or(raw).to_string()
}

fn parse_count(raw: &str) -> Result<u32, StatusParseError> {
    raw.parse()
        .map_err(|_| StatusParseError::Overflow(raw.to_string()))
}

/// Parse a title of the form `<prefix> - <map> <players>/<max> (<playlist>)`.
pub fn parse_status(title: &str) -> Result<StatusRecord, StatusParseError> {
    let caps = status_regex()
        .captures(title)
        .ok_or(StatusParseError::NoMatch)?;
    Ok(StatusRecord {
        map_name: bounded_name(&caps[1]),
        player_count: parse_count(&caps[2])?,
        max_players: parse_count(&caps[3])?,
        playlist_name: bounded_name(&caps[4]),
    })
}

impl fmt::Display for StatusRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.player_count)?;
        if self.max_players > 0 {
            write!(f, "/{}", self.max_players)?;
        } else {
            f.write_str("/?")?;
        }
        for name in [&self.map_name, &self.playlist_name] {
            if name.is_empty() {
                f.write_str(" ???")?;
            } else {
                write!(f, " {name}")?;
            }
        }
        Ok(())
    }
}

/// Parses each title and reports a failure once per run of failures.
#[derive(Debug, Default)]
pub struct StatusTracker {
    warned: bool,
    latest: Option<StatusRecord>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `title`; a successful parse replaces the latest record.
    pub fn observe(&mut self, title: &str) -> Option<&StatusRecord> {
        match parse_status(title) {
            Ok(record) => {
                self.warned = false;
                self.latest = Some(record);
                self.latest.as_ref()
            }
            Err(err) => {
                if !self.warned {
                    warn!(
                        %title,
                        "failed to parse title ({err}); status information will not be visible in the process list"
                    );
                    self.warned = true;
                }
                None
            }
        }
    }

    pub fn latest(&self) -> Option<&StatusRecord> {
        self.latest.as_ref()
    }

    pub fn warned(&self) -> bool {
        self.warned
    }
}
