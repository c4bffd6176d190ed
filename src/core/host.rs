//! Hosts and their reservation records.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::class::FARM;

/// Sentinel owner for a host that stopped answering probes.
pub const DEATH: &str = "DEATH";

/// A managed host or resource and its reservation state.
///
/// All expiry/ping fields are seconds since the Unix epoch; 0 means unset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    /// Names of the atomic classes this host belongs to. Either all
    /// resource (exactly one) or all non-resource.
    pub classes: Vec<String>,

    pub user: Option<String>,
    pub expiry: u64,
    pub msg: String,
    /// Bearer token required to release the reservation.
    pub key: Option<String>,

    pub next_user: Option<String>,
    pub next_expiry: u64,
    pub next_msg: String,

    /// Reservation snapshot taken when the host is marked dead.
    pub old_user: Option<String>,
    pub old_expiry: u64,
    pub old_msg: String,

    pub last_ping_time: u64,
    /// Rate limiter for expiry notifications.
    pub next_notify: u64,
}

impl Host {
    pub fn new(name: impl Into<String>, classes: Vec<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            classes,
            user: None,
            expiry: 0,
            msg: String::new(),
            key: None,
            next_user: None,
            next_expiry: 0,
            next_msg: String::new(),
            old_user: None,
            old_expiry: 0,
            old_msg: String::new(),
            last_ping_time: now,
            next_notify: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reserved covers dead hosts too: DEATH holds the reservation.
    pub fn is_reserved(&self) -> bool {
        self.user.is_some()
    }

    pub fn is_dead(&self) -> bool {
        self.user.as_deref() == Some(DEATH)
    }

    pub fn is_reserved_by(&self, user: &str) -> bool {
        self.user.as_deref() == Some(user)
    }

    pub fn next_user_set(&self) -> bool {
        self.next_user.is_some()
    }

    /// Install a fresh reservation, clearing any queued successor.
    pub fn reserve(&mut self, user: &str, expiry: u64, msg: &str, key: Option<&str>) {
        self.user = Some(user.to_string());
        self.expiry = expiry;
        self.msg = msg.to_string();
        self.key = key.map(str::to_string);
        self.next_user = None;
        self.next_expiry = 0;
        self.next_msg = String::new();
        self.next_notify = 0;
    }

    /// Drop the reservation record entirely.
    pub fn clear_reservation(&mut self) {
        self.user = None;
        self.expiry = 0;
        self.msg = String::new();
        self.key = None;
        self.next_user = None;
        self.next_expiry = 0;
        self.next_msg = String::new();
        self.next_notify = 0;
    }

    /// Promote the queued successor to owner. The release key never
    /// carries over. Returns the new owner's name.
    pub fn promote_next_user(&mut self) -> Option<String> {
        let next = self.next_user.take()?;
        self.user = Some(next.clone());
        self.expiry = self.next_expiry;
        self.msg = std::mem::take(&mut self.next_msg);
        self.key = None;
        self.next_expiry = 0;
        self.next_notify = 0;
        Some(next)
    }

    /// Snapshot the reservation and hand the host to DEATH.
    pub fn mark_dead(&mut self, msg: String) {
        self.old_user = self.user.take();
        self.old_expiry = self.expiry;
        self.old_msg = std::mem::take(&mut self.msg);
        self.user = Some(DEATH.to_string());
        self.expiry = 0;
        self.msg = msg;
    }

    /// Restore the snapshot taken at mark-dead.
    pub fn revive(&mut self, now: u64) {
        self.user = self.old_user.take();
        self.expiry = self.old_expiry;
        self.msg = std::mem::take(&mut self.old_msg);
        self.old_expiry = 0;
        self.last_ping_time = now;
    }
}

/// Host names are word/dot tokens, plus the hyphen that numbered siblings
/// (`node-3`) carry.
pub fn valid_host_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\w.-]+$").expect("static regex"))
        .is_match(name)
}

/// Canonicalize a client-supplied hostname.
pub fn canon(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Host ordering: hosts in the default reserve class sort after hosts not
/// in it; numbered siblings (`prefix-N`) sort by numeric suffix; the rest
/// by name. Class-reservation candidates are handed out in this order.
pub fn host_order(a: &Host, b: &Host) -> Ordering {
    let a_farm = a.classes.iter().any(|c| c == FARM);
    let b_farm = b.classes.iter().any(|c| c == FARM);
    a_farm
        .cmp(&b_farm)
        .then_with(|| name_order(&a.name, &b.name))
}

fn name_order(a: &str, b: &str) -> Ordering {
    if let (Some((pa, na)), Some((pb, nb))) = (split_numbered(a), split_numbered(b))
        && pa == pb
    {
        return na.cmp(&nb);
    }
    a.cmp(b)
}

fn split_numbered(name: &str) -> Option<(&str, u64)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let caps = RE
        .get_or_init(|| Regex::new(r"^(.*)-(\d+)$").expect("static regex"))
        .captures(name)?;
    let prefix = caps.get(1)?.as_str();
    let number = caps.get(2)?.as_str().parse().ok()?;
    Some((prefix, number))
}
