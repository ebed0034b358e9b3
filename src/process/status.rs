//! Keying daemon status parsing
//!
//! `ipsec whack --status` prints free text; the lines that matter follow a
//! fixed grammar:
//!
//! ```text
//! <3-digit code> "<connection id>[/<instance>]"<anything> <unrouted|erouted>;
//! ```
//!
//! Every other line is ignored.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::model::Status;

/// Tracked state of one connection inside a process
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: Option<Status>,
    pub updated_pending_status: bool,
}

pub type ConnectionStatusMap = BTreeMap<String, ConnectionStatus>;

fn status_line() -> &'static Regex {
    static STATUS_LINE: OnceLock<Regex> = OnceLock::new();
    STATUS_LINE.get_or_init(|| {
        Regex::new(r#"\d{3} "([^"/]+)[^"]*".* (unrouted|erouted);"#).expect("status pattern is valid")
    })
}

fn map_state(keyword: &str) -> Option<Status> {
    match keyword {
        "erouted" => Some(Status::Active),
        "unrouted" => Some(Status::Down),
        _ => None,
    }
}

/// Extract `(connection id, status)` pairs in output order
pub fn parse_status(output: &str) -> Vec<(String, Status)> {
    output
        .lines()
        .filter_map(|line| {
            let caps = status_line().captures(line)?;
            let status = map_state(&caps[2])?;
            Some((caps[1].to_string(), status))
        })
        .collect()
}

/// Fold daemon output into the tracked map.
///
/// Connections the daemon reports but the map does not know yet are added,
/// so the map grows to whatever the daemon is actually running.
pub fn update_connection_status(map: &mut ConnectionStatusMap, output: &str) {
    for (id, status) in parse_status(output) {
        map.entry(id).or_default().status = Some(status);
    }
}
