//! Daemon core: the single-writer owner of the registry.
//!
//! Every mutation of the model goes through one `Daemon` value on one
//! thread. Handlers validate fully before touching state, so an error
//! response always means nothing changed.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use regex::Regex;
use serde_json::{Value, json};
use time::{OffsetDateTime, UtcOffset};

use super::notify::Notifier;
use super::ops::OpError;
use crate::config::Config;
use crate::core::{
    ALL, Class, DEATH, FARM, Host, Registry, canon, class_order, host_order, valid_class_name,
    valid_host_name,
};

/// Seconds since the Unix epoch.
pub fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Render an epoch timestamp in local time for operator-facing text.
pub fn local_time_string(epoch: u64) -> String {
    let Ok(ts) = OffsetDateTime::from_unix_timestamp(epoch as i64) else {
        return epoch.to_string();
    };
    let ts = ts.to_offset(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC));
    match time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]") {
        Ok(fmt) => ts.format(&fmt).unwrap_or_else(|_| epoch.to_string()),
        Err(_) => epoch.to_string(),
    }
}

pub struct Daemon {
    registry: Registry,
    config: Config,
    notifier: Box<dyn Notifier>,
}

impl Daemon {
    pub fn new(config: Config, notifier: Box<dyn Notifier>) -> Self {
        Self::with_registry(Registry::default(), config, notifier)
    }

    /// Wrap a registry loaded from disk. Runs initialization, so the
    /// default classes exist afterwards either way.
    pub fn with_registry(
        mut registry: Registry,
        config: Config,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        registry.ensure_defaults();
        Self {
            registry,
            config,
            notifier,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn validate_user(user: &str) -> Result<(), OpError> {
        if user.is_empty() {
            return Err(OpError::EmptyUser);
        }
        if user == "root" {
            return Err(OpError::RootForbidden);
        }
        Ok(())
    }

    // =========================================================================
    // Class administration
    // =========================================================================

    pub fn add_class(
        &mut self,
        name: &str,
        members: &[String],
        description: &str,
    ) -> Result<String, OpError> {
        if !valid_class_name(name) {
            return Err(OpError::InvalidClassName(name.to_string()));
        }
        if self.registry.classes.contains_key(name) {
            return Err(OpError::ClassExists(name.to_string()));
        }
        for member in members {
            let class = self
                .registry
                .class(member)
                .ok_or_else(|| OpError::NoSuchClass(member.clone()))?;
            if class.is_composite() {
                return Err(OpError::CompositeMember(member.clone()));
            }
            if class.resource {
                return Err(OpError::ResourceMember(member.clone()));
            }
        }
        let class = if members.is_empty() {
            Class::atomic(name, description)
        } else {
            Class::composite(name, description, members.to_vec())
        };
        self.registry.classes.insert(name.to_string(), class);
        tracing::info!(class = name, "added class");
        Ok(format!("added class {name}"))
    }

    pub fn add_resource_class(&mut self, name: &str, description: &str) -> Result<String, OpError> {
        if !valid_class_name(name) {
            return Err(OpError::InvalidClassName(name.to_string()));
        }
        if self.registry.classes.contains_key(name) {
            return Err(OpError::ClassExists(name.to_string()));
        }
        self.registry
            .classes
            .insert(name.to_string(), Class::resource(name, description));
        tracing::info!(class = name, "added resource class");
        Ok(format!("added resource class {name}"))
    }

    pub fn del_class(&mut self, name: &str) -> Result<String, OpError> {
        if name == ALL {
            return Err(OpError::CannotDeleteAll);
        }
        let class = self
            .registry
            .classes
            .get(name)
            .ok_or_else(|| OpError::NoSuchClass(name.to_string()))?;

        // A resource class takes its resources with it.
        let mut deleted_resources = Vec::new();
        if class.resource {
            deleted_resources = self
                .registry
                .hosts
                .values()
                .filter(|h| h.classes.iter().any(|c| c == name))
                .map(|h| h.name.clone())
                .collect();
            for resource in &deleted_resources {
                self.registry.hosts.remove(resource);
            }
        }

        for host in self.registry.hosts.values_mut() {
            host.classes.retain(|c| c != name);
        }
        for other in self.registry.classes.values_mut() {
            other.members.retain(|m| m != name);
        }
        self.registry.classes.remove(name);

        tracing::info!(class = name, deleted = deleted_resources.len(), "deleted class");
        if deleted_resources.is_empty() {
            Ok(format!("deleted class {name}"))
        } else {
            Ok(format!(
                "deleted class {name} (deleted resources: {})",
                deleted_resources.join(", ")
            ))
        }
    }

    // =========================================================================
    // Host administration
    // =========================================================================

    pub fn add_host(&mut self, host: &str, classes: &[String]) -> Result<String, OpError> {
        let name = canon(host);
        if !valid_host_name(&name) {
            return Err(OpError::InvalidHostName(name));
        }
        if self.registry.hosts.contains_key(&name) {
            return Err(OpError::HostExists(name));
        }
        let classes: Vec<String> = if classes.is_empty() {
            vec![ALL.to_string()]
        } else {
            classes.to_vec()
        };
        for class_name in &classes {
            let class = self
                .registry
                .class(class_name)
                .ok_or_else(|| OpError::NoSuchClass(class_name.clone()))?;
            if class.is_composite() {
                return Err(OpError::CompositeNotAllowed(class_name.clone()));
            }
            if class.resource {
                return Err(OpError::ResourceClassNotAllowed(class_name.clone()));
            }
        }
        self.registry
            .hosts
            .insert(name.clone(), Host::new(name.clone(), classes, now_epoch()));
        tracing::info!(host = %name, "added host");
        Ok(format!("added host {name}"))
    }

    pub fn add_resource(&mut self, resource: &str, class_name: &str) -> Result<String, OpError> {
        let name = canon(resource);
        if !valid_host_name(&name) {
            return Err(OpError::InvalidHostName(name));
        }
        if self.registry.hosts.contains_key(&name) {
            return Err(OpError::HostExists(name));
        }
        let class = self
            .registry
            .class(class_name)
            .ok_or_else(|| OpError::NoSuchClass(class_name.to_string()))?;
        if !class.resource {
            return Err(OpError::NotAResourceClass(class_name.to_string()));
        }
        self.registry.hosts.insert(
            name.clone(),
            Host::new(name.clone(), vec![class_name.to_string()], now_epoch()),
        );
        tracing::info!(resource = %name, class = class_name, "added resource");
        Ok(format!("added resource {name}"))
    }

    pub fn del_host(&mut self, host: &str) -> Result<String, OpError> {
        let name = canon(host);
        if self.registry.hosts.remove(&name).is_none() {
            return Err(OpError::NoSuchHost(name));
        }
        tracing::info!(host = %name, "deleted host");
        Ok(format!("deleted host {name}"))
    }

    pub fn modify_host(
        &mut self,
        host: &str,
        user: &str,
        add: &[String],
        del: &[String],
    ) -> Result<String, OpError> {
        let name = canon(host);
        let current = self
            .registry
            .host(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;

        let mut classes = current.classes.clone();
        classes.retain(|c| !del.contains(c));
        for class_name in add {
            let class = self
                .registry
                .class(class_name)
                .ok_or_else(|| OpError::NoSuchClass(class_name.clone()))?;
            if class.is_composite() {
                return Err(OpError::CompositeNotAllowed(class_name.clone()));
            }
            if !classes.contains(class_name) {
                classes.push(class_name.clone());
            }
        }

        let resource_count = classes
            .iter()
            .filter(|c| self.registry.class(c).is_some_and(|cl| cl.resource))
            .count();
        let has_plain = classes
            .iter()
            .any(|c| self.registry.class(c).is_some_and(|cl| !cl.resource));
        if resource_count > 1 {
            return Err(OpError::TooManyResourceClasses(name));
        }
        if resource_count > 0 && has_plain {
            return Err(OpError::FlavorMismatch(name));
        }

        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        entry.classes = classes;
        tracing::info!(host = %name, user, "modified host classes");
        Ok(format!("modified host {name}"))
    }

    // =========================================================================
    // Reservations
    // =========================================================================

    pub fn reserve_host(
        &mut self,
        host: &str,
        user: &str,
        expire: u64,
        msg: &str,
        key: Option<&str>,
        via_resource: bool,
    ) -> Result<String, OpError> {
        Self::validate_user(user)?;
        let name = canon(host);
        let entry = self
            .registry
            .host(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        let is_resource = self.registry.host_is_resource(entry);
        if is_resource && !via_resource {
            return Err(OpError::IsResource(name));
        }
        if !is_resource && via_resource {
            return Err(OpError::NotAResource(name));
        }
        if let Some(by) = &entry.user {
            return Err(OpError::AlreadyReserved {
                host: name,
                by: by.clone(),
            });
        }

        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        entry.reserve(user, expire, msg, key);
        tracing::info!(host = %name, user, expire, "reserved host");
        Ok(format!("reserved {name}"))
    }

    /// Reserve `numhosts` free hosts drawn from a class expression.
    /// All-or-nothing: a short candidate list reserves nothing.
    pub fn reserve_class(
        &mut self,
        class_expr: &str,
        numhosts: u64,
        user: &str,
        expire: u64,
        msg: &str,
        key: Option<&str>,
        randomize: bool,
    ) -> Result<(String, Vec<String>), OpError> {
        Self::validate_user(user)?;
        if numhosts == 0 {
            return Err(OpError::InvalidNumhosts("0".to_string()));
        }
        let expr = if class_expr.trim().is_empty() {
            FARM
        } else {
            class_expr
        };
        let names = self.registry.resolve_expr(expr)?;

        let mut candidates: Vec<&Host> = self
            .registry
            .hosts
            .values()
            .filter(|h| !h.is_reserved())
            .filter(|h| !self.registry.host_is_resource(h))
            .filter(|h| self.registry.expr_contains_host(&names, h))
            .collect();
        if (candidates.len() as u64) < numhosts {
            return Err(OpError::NotEnoughFree {
                wanted: numhosts,
                free: candidates.len() as u64,
            });
        }
        if randomize {
            candidates.shuffle(&mut rand::rng());
        } else {
            candidates.sort_by(|a, b| host_order(a, b));
        }
        let selected: Vec<String> = candidates
            .iter()
            .take(numhosts as usize)
            .map(|h| h.name.clone())
            .collect();

        for name in &selected {
            if let Some(host) = self.registry.host_mut(name) {
                host.reserve(user, expire, msg, key);
            }
        }
        tracing::info!(class = expr, user, count = selected.len(), "reserved hosts by class");

        let mut reported = selected;
        reported.reverse();
        let message = format!("reserved {} hosts in class {expr}", reported.len());
        Ok((message, reported))
    }

    pub fn release(
        &mut self,
        host: &str,
        user: &str,
        msg: &str,
        key: Option<&str>,
        force: bool,
        via_resource: bool,
    ) -> Result<String, OpError> {
        let name = canon(host);
        let entry = self
            .registry
            .host(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        let is_resource = self.registry.host_is_resource(entry);
        if via_resource && !is_resource {
            return Err(OpError::NotAResource(name));
        }
        if !via_resource && is_resource {
            return Err(OpError::IsResource(name));
        }
        let Some(owner) = entry.user.clone() else {
            return Err(OpError::NotReserved(name));
        };
        if !force {
            if owner != user {
                return Err(OpError::NotReservedBy {
                    host: name,
                    user: user.to_string(),
                });
            }
            if let Some(expected) = entry.key.as_deref()
                && key != Some(expected)
            {
                return Err(OpError::WrongKey {
                    host: name,
                    expected: expected.to_string(),
                });
            }
        }

        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        let message;
        let mut handoff = None;
        if let Some(new_owner) = entry.promote_next_user() {
            message = format!("released {name} and reserved it for {new_owner}");
            handoff = Some(new_owner);
        } else {
            entry.clear_reservation();
            message = format!("released {name}");
        }
        tracing::info!(host = %name, user, msg, force, "released host");

        if let Some(new_owner) = handoff {
            let subject = format!("{name} is yours");
            let body = format!("Reserved {name} at {}", local_time_string(now_epoch()));
            if let Err(e) = self.notifier.notify_chat(&new_owner, &subject, &body) {
                tracing::warn!(user = %new_owner, host = %name, error = %e, "handoff notification failed");
            }
        }
        Ok(message)
    }

    pub fn renew(
        &mut self,
        host: &str,
        user: &str,
        expire: u64,
        msg: &str,
    ) -> Result<String, OpError> {
        let name = canon(host);
        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        if !entry.is_reserved_by(user) {
            return Err(OpError::NotReservedBy {
                host: name,
                user: user.to_string(),
            });
        }
        entry.expiry = expire;
        if !msg.is_empty() {
            entry.msg = msg.to_string();
        }
        tracing::info!(host = %name, user, expire, "renewed reservation");
        Ok(format!("renewed {name}"))
    }

    pub fn verify(&self, host: &str, user: &str) -> Result<String, OpError> {
        let name = canon(host);
        let entry = self
            .registry
            .host(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        if !entry.is_reserved_by(user) {
            return Err(OpError::NotReservedBy {
                host: name,
                user: user.to_string(),
            });
        }
        Ok(format!("{name} is reserved by {user}"))
    }

    pub fn add_next_user(
        &mut self,
        host: &str,
        user: &str,
        expire: u64,
        msg: &str,
    ) -> Result<String, OpError> {
        Self::validate_user(user)?;
        let name = canon(host);
        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        let Some(owner) = entry.user.clone() else {
            return Err(OpError::NotReserved(name));
        };
        if owner == user {
            return Err(OpError::AlreadyCurrentUser {
                host: name,
                user: user.to_string(),
            });
        }
        if let Some(next) = &entry.next_user {
            return Err(OpError::NextUserTaken {
                host: name,
                next: next.clone(),
            });
        }
        entry.next_user = Some(user.to_string());
        entry.next_expiry = expire;
        entry.next_msg = msg.to_string();
        tracing::info!(host = %name, user, "queued next user");
        Ok(format!("added next user {user} for {name}"))
    }

    /// Clear the queued successor. Owner-only, like release/renew/verify.
    pub fn del_next_user(&mut self, host: &str, user: &str) -> Result<String, OpError> {
        let name = canon(host);
        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        if !entry.is_reserved_by(user) {
            return Err(OpError::NotReservedBy {
                host: name,
                user: user.to_string(),
            });
        }
        let Some(next) = entry.next_user.take() else {
            return Err(OpError::NoNextUser(name));
        };
        entry.next_expiry = 0;
        entry.next_msg = String::new();
        tracing::info!(host = %name, user, next = %next, "removed next user");
        Ok(format!("removed next user {next} from {name}"))
    }

    pub fn get_current_user(&self, host: &str) -> Result<(String, Value), OpError> {
        let name = canon(host);
        let entry = self
            .registry
            .host(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        match &entry.user {
            Some(user) => Ok((format!("{name} is reserved by {user}"), json!(user))),
            None => Ok((format!("{name} is not reserved"), Value::Null)),
        }
    }

    pub fn revive(&mut self, host: &str, all: bool) -> Result<String, OpError> {
        let now = now_epoch();
        if all {
            let mut revived = 0;
            for entry in self.registry.hosts.values_mut() {
                if entry.is_dead() {
                    entry.revive(now);
                    revived += 1;
                }
            }
            tracing::info!(revived, "revived all dead hosts");
            return Ok(format!("revived {revived} hosts"));
        }
        let name = canon(host);
        let entry = self
            .registry
            .host_mut(&name)
            .ok_or_else(|| OpError::NoSuchHost(name.clone()))?;
        if !entry.is_dead() {
            return Err(OpError::NotDead(name));
        }
        entry.revive(now);
        tracing::info!(host = %name, "revived host");
        Ok(format!("revived {name}"))
    }

    // =========================================================================
    // Listings
    // =========================================================================

    pub fn list_classes(&self, class_expr: &str) -> Result<(String, Value), OpError> {
        let mut classes: Vec<&Class> = if class_expr.trim().is_empty() {
            self.registry.classes.values().collect()
        } else {
            self.registry
                .resolve_expr(class_expr)?
                .iter()
                .filter_map(|name| self.registry.class(name))
                .collect()
        };
        classes.sort_by(|a, b| class_order(a, b));

        let rows: Vec<Value> = classes
            .iter()
            .map(|class| {
                let description = if class.description.is_empty() {
                    " "
                } else {
                    class.description.as_str()
                };
                let mut row = vec![
                    json!(class.name),
                    json!(description),
                    json!(u8::from(class.resource)),
                ];
                row.extend(class.members.iter().map(|m| json!(m)));
                Value::Array(row)
            })
            .collect();
        Ok((format!("{} classes", rows.len()), Value::Array(rows)))
    }

    pub fn list_hosts(
        &self,
        class_expr: &str,
        user: &str,
        verbose: bool,
        next: bool,
        host_regexp: Option<&str>,
    ) -> Result<(String, Value), OpError> {
        let class_filter = if class_expr.trim().is_empty() {
            None
        } else {
            Some(self.registry.resolve_expr(class_expr)?)
        };
        let user_filter = if user.is_empty() { None } else { Some(user) };
        let name_filter = match host_regexp {
            Some(pattern) if !pattern.is_empty() => Some(
                Regex::new(pattern).map_err(|_| OpError::BadHostRegexp(pattern.to_string()))?,
            ),
            _ => None,
        };

        let mut hosts: Vec<&Host> = self
            .registry
            .hosts
            .values()
            .filter(|h| match &class_filter {
                Some(names) => self.registry.expr_contains_host(names, h),
                None => true,
            })
            .filter(|h| match user_filter {
                Some(u) => h.user.as_deref() == Some(u),
                None => true,
            })
            .filter(|h| match &name_filter {
                Some(re) => re.is_match(&h.name),
                None => true,
            })
            // The bare listing hides resources.
            .filter(|h| {
                class_filter.is_some() || user_filter.is_some() || !self.registry.host_is_resource(h)
            })
            .collect();
        hosts.sort_by(|a, b| host_order(a, b));

        let rows: Vec<Value> = hosts
            .iter()
            .map(|h| {
                if verbose {
                    json!([h.name, h.user, h.classes.join(", ")])
                } else if next {
                    json!([h.name, h.user, h.next_user, h.next_expiry, h.next_msg])
                } else {
                    json!([h.name, h.user, h.expiry, h.msg])
                }
            })
            .collect();
        Ok((format!("{} hosts", rows.len()), Value::Array(rows)))
    }

    // =========================================================================
    // Background passes
    // =========================================================================

    /// Names the liveness pass should probe: every non-resource host.
    pub fn ping_candidates(&self) -> Vec<String> {
        self.registry
            .hosts
            .values()
            .filter(|h| !self.registry.host_is_resource(h))
            .map(|h| h.name.clone())
            .collect()
    }

    /// Apply one probe cycle: acknowledged hosts get their ping time
    /// refreshed (and come back from the dead); silent idle hosts past the
    /// dead time are marked dead. Returns whether state must be persisted.
    pub fn apply_probe_outcome(
        &mut self,
        reachable: &BTreeSet<String>,
        cycle_start: u64,
        now: u64,
    ) -> bool {
        let names = self.ping_candidates();
        let mut mutated = false;

        for name in &names {
            if !reachable.contains(name) {
                continue;
            }
            if let Some(host) = self.registry.host_mut(name) {
                host.last_ping_time = cycle_start;
                if host.is_dead() {
                    host.revive(now);
                    tracing::info!(host = %name, "host answered probe, revived");
                    mutated = true;
                }
            }
        }

        for name in &names {
            let Some(host) = self.registry.host_mut(name) else {
                continue;
            };
            if host.is_reserved()
                || host.last_ping_time == 0
                || now.saturating_sub(host.last_ping_time) <= self.config.dead_time
            {
                continue;
            }
            host.mark_dead(format!("Lost contact at: {}", local_time_string(now)));
            tracing::warn!(host = %name, "host silent past dead time, marked dead");
            mutated = true;
        }
        mutated
    }

    /// Notify owners of expired reservations, rate-limited per host. Never
    /// touches the reservation itself.
    pub fn expiry_pass(&mut self, now: u64) -> bool {
        let interval = self.config.notify_interval;
        let mut mutated = false;
        for host in self.registry.hosts.values_mut() {
            let Some(user) = host.user.clone() else {
                continue;
            };
            if host.expiry == 0 || host.expiry >= now || host.next_notify > now {
                continue;
            }
            let first = host.next_notify == 0;
            host.next_notify = now + interval;
            mutated = true;
            if user == DEATH {
                continue;
            }

            let subject = format!("reservation of {} expired", host.name);
            let body = format!(
                "Your reservation of {} expired at {}",
                host.name,
                local_time_string(host.expiry)
            );
            if let Err(e) = self.notifier.notify_chat(&user, &subject, &body) {
                tracing::warn!(%user, host = %host.name, error = %e, "expiry chat notification failed");
            }
            if first
                && let Err(e) = self.notifier.notify_mail("rsvpd", &user, &subject, &body)
            {
                tracing::warn!(%user, host = %host.name, error = %e, "expiry mail notification failed");
            }
        }
        mutated
    }
}
