//! Request dispatch.
//!
//! A static table maps each command to its handler and declared parameter
//! lists. Validation happens before any handler runs: required keys must be
//! present and non-null, and no unknown keys are accepted.

use serde_json::Value;

use super::core::Daemon;
use super::ops::OpError;
use super::wire::{Params, Response};

pub struct DispatchOutcome {
    pub response: Response,
    /// Whether the state file must be rewritten before replying.
    pub mutated: bool,
}

type Handler = fn(&mut Daemon, &Params) -> Result<(String, Value), OpError>;

struct CommandSpec {
    name: &'static str,
    required: &'static [&'static str],
    optional: &'static [&'static str],
    mutates: bool,
    handler: Handler,
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        name: "add_class",
        required: &["class", "members", "description"],
        optional: &[],
        mutates: true,
        handler: h_add_class,
    },
    CommandSpec {
        name: "add_host",
        required: &["host", "classes"],
        optional: &[],
        mutates: true,
        handler: h_add_host,
    },
    CommandSpec {
        name: "add_resource",
        required: &["resource", "class"],
        optional: &[],
        mutates: true,
        handler: h_add_resource,
    },
    CommandSpec {
        name: "add_resource_class",
        required: &["class", "description"],
        optional: &[],
        mutates: true,
        handler: h_add_resource_class,
    },
    CommandSpec {
        name: "add_next_user",
        required: &["host", "user", "expire", "msg"],
        optional: &[],
        mutates: true,
        handler: h_add_next_user,
    },
    CommandSpec {
        name: "del_class",
        required: &["class"],
        optional: &[],
        mutates: true,
        handler: h_del_class,
    },
    CommandSpec {
        name: "del_host",
        required: &["host"],
        optional: &[],
        mutates: true,
        handler: h_del_host,
    },
    CommandSpec {
        name: "del_next_user",
        required: &["host", "user"],
        optional: &[],
        mutates: true,
        handler: h_del_next_user,
    },
    CommandSpec {
        name: "get_current_user",
        required: &["host"],
        optional: &[],
        mutates: false,
        handler: h_get_current_user,
    },
    CommandSpec {
        name: "list_hosts",
        required: &["class", "user", "verbose"],
        optional: &["next", "hostRegexp"],
        mutates: false,
        handler: h_list_hosts,
    },
    CommandSpec {
        name: "list_classes",
        required: &["class"],
        optional: &[],
        mutates: false,
        handler: h_list_classes,
    },
    CommandSpec {
        name: "modify_host",
        required: &["host", "user", "addClasses", "delClasses"],
        optional: &[],
        mutates: true,
        handler: h_modify_host,
    },
    CommandSpec {
        name: "release_resource",
        required: &["resource", "user", "msg"],
        optional: &["key", "force"],
        mutates: true,
        handler: h_release_resource,
    },
    CommandSpec {
        name: "release_rsvp",
        required: &["host", "user", "msg"],
        optional: &["key", "force"],
        mutates: true,
        handler: h_release_rsvp,
    },
    CommandSpec {
        name: "renew_rsvp",
        required: &["host", "user", "expire", "msg"],
        optional: &[],
        mutates: true,
        handler: h_renew_rsvp,
    },
    CommandSpec {
        name: "revive_host",
        required: &["host", "all"],
        optional: &[],
        mutates: true,
        handler: h_revive_host,
    },
    CommandSpec {
        name: "rsvp_class",
        required: &["class", "numhosts", "user", "expire", "msg"],
        optional: &["key", "randomize"],
        mutates: true,
        handler: h_rsvp_class,
    },
    CommandSpec {
        name: "rsvp_host",
        required: &["host", "user", "expire", "msg"],
        optional: &["key", "resource"],
        mutates: true,
        handler: h_rsvp_host,
    },
    CommandSpec {
        name: "verify_rsvp",
        required: &["host", "user"],
        optional: &[],
        mutates: false,
        handler: h_verify_rsvp,
    },
];

/// Route one request. Always produces exactly one response; `mutated` is
/// set only when the handler succeeded on a state-changing command.
pub fn dispatch(daemon: &mut Daemon, cmd: &str, params: &Params) -> DispatchOutcome {
    let Some(spec) = COMMANDS.iter().find(|s| s.name == cmd) else {
        tracing::debug!(cmd, "unknown command");
        return DispatchOutcome {
            response: Response::err(&OpError::UnknownCommand(cmd.to_string())),
            mutated: false,
        };
    };
    if let Err(e) = validate_params(spec, params) {
        return DispatchOutcome {
            response: Response::err(&e),
            mutated: false,
        };
    }
    match (spec.handler)(daemon, params) {
        Ok((message, data)) => DispatchOutcome {
            response: Response::success_with(message, data),
            mutated: spec.mutates,
        },
        Err(e) => {
            tracing::debug!(cmd, error = %e, "request failed");
            DispatchOutcome {
                response: Response::err(&e),
                mutated: false,
            }
        }
    }
}

fn validate_params(spec: &CommandSpec, params: &Params) -> Result<(), OpError> {
    for key in spec.required {
        match params.get(*key) {
            Some(value) if !value.is_null() => {}
            _ => {
                return Err(OpError::MissingParam {
                    cmd: spec.name.to_string(),
                    key: (*key).to_string(),
                });
            }
        }
    }
    for key in params.keys() {
        let known = spec.required.contains(&key.as_str()) || spec.optional.contains(&key.as_str());
        if !known {
            return Err(OpError::UnknownParam {
                cmd: spec.name.to_string(),
                key: key.clone(),
            });
        }
    }
    Ok(())
}

// =============================================================================
// Parameter extraction
// =============================================================================

fn str_param<'a>(params: &'a Params, key: &str) -> Result<&'a str, OpError> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(OpError::BadParam {
            key: key.to_string(),
            reason: format!("expected string, got {other}"),
        }),
        None => Err(OpError::BadParam {
            key: key.to_string(),
            reason: "missing".to_string(),
        }),
    }
}

fn opt_str_param<'a>(params: &'a Params, key: &str) -> Result<Option<&'a str>, OpError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(OpError::BadParam {
            key: key.to_string(),
            reason: format!("expected string, got {other}"),
        }),
    }
}

/// Legacy truthiness: 0, "0", "", null, and absence are false.
fn flag_param(params: &Params, key: &str) -> bool {
    match params.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0) != 0.0,
        Some(Value::String(s)) => !s.is_empty() && s.as_str() != "0",
        _ => false,
    }
}

/// Non-negative integer, as a JSON number or a decimal-digit string.
fn int_param(params: &Params, key: &str) -> Result<u64, String> {
    match params.get(key) {
        Some(Value::Number(n)) => n.as_u64().ok_or_else(|| n.to_string()),
        Some(Value::String(s)) => {
            if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
                s.parse().map_err(|_| s.clone())
            } else {
                Err(s.clone())
            }
        }
        Some(other) => Err(other.to_string()),
        None => Err("missing".to_string()),
    }
}

fn expire_param(params: &Params, key: &str) -> Result<u64, OpError> {
    int_param(params, key).map_err(OpError::InvalidExpire)
}

fn numhosts_param(params: &Params, key: &str) -> Result<u64, OpError> {
    int_param(params, key).map_err(OpError::InvalidNumhosts)
}

/// Class lists arrive as JSON arrays of strings or comma-joined strings.
fn list_param(params: &Params, key: &str) -> Result<Vec<String>, OpError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(String::from)
            .collect()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(OpError::BadParam {
                    key: key.to_string(),
                    reason: format!("expected string element, got {other}"),
                }),
            })
            .collect(),
        Some(other) => Err(OpError::BadParam {
            key: key.to_string(),
            reason: format!("expected list, got {other}"),
        }),
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn h_add_class(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let members = list_param(p, "members")?;
    let msg = d.add_class(str_param(p, "class")?, &members, str_param(p, "description")?)?;
    Ok((msg, Value::Null))
}

fn h_add_host(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let classes = list_param(p, "classes")?;
    let msg = d.add_host(str_param(p, "host")?, &classes)?;
    Ok((msg, Value::Null))
}

fn h_add_resource(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.add_resource(str_param(p, "resource")?, str_param(p, "class")?)?;
    Ok((msg, Value::Null))
}

fn h_add_resource_class(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.add_resource_class(str_param(p, "class")?, str_param(p, "description")?)?;
    Ok((msg, Value::Null))
}

fn h_add_next_user(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.add_next_user(
        str_param(p, "host")?,
        str_param(p, "user")?,
        expire_param(p, "expire")?,
        str_param(p, "msg")?,
    )?;
    Ok((msg, Value::Null))
}

fn h_del_class(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    Ok((d.del_class(str_param(p, "class")?)?, Value::Null))
}

fn h_del_host(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    Ok((d.del_host(str_param(p, "host")?)?, Value::Null))
}

fn h_del_next_user(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.del_next_user(str_param(p, "host")?, str_param(p, "user")?)?;
    Ok((msg, Value::Null))
}

fn h_get_current_user(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    d.get_current_user(str_param(p, "host")?)
}

fn h_list_hosts(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    d.list_hosts(
        str_param(p, "class")?,
        str_param(p, "user")?,
        flag_param(p, "verbose"),
        flag_param(p, "next"),
        opt_str_param(p, "hostRegexp")?,
    )
}

fn h_list_classes(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    d.list_classes(str_param(p, "class")?)
}

fn h_modify_host(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let add = list_param(p, "addClasses")?;
    let del = list_param(p, "delClasses")?;
    let msg = d.modify_host(str_param(p, "host")?, str_param(p, "user")?, &add, &del)?;
    Ok((msg, Value::Null))
}

fn h_release_resource(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.release(
        str_param(p, "resource")?,
        str_param(p, "user")?,
        str_param(p, "msg")?,
        opt_str_param(p, "key")?,
        flag_param(p, "force"),
        true,
    )?;
    Ok((msg, Value::Null))
}

fn h_release_rsvp(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.release(
        str_param(p, "host")?,
        str_param(p, "user")?,
        str_param(p, "msg")?,
        opt_str_param(p, "key")?,
        flag_param(p, "force"),
        false,
    )?;
    Ok((msg, Value::Null))
}

fn h_renew_rsvp(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.renew(
        str_param(p, "host")?,
        str_param(p, "user")?,
        expire_param(p, "expire")?,
        str_param(p, "msg")?,
    )?;
    Ok((msg, Value::Null))
}

fn h_revive_host(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.revive(str_param(p, "host")?, flag_param(p, "all"))?;
    Ok((msg, Value::Null))
}

fn h_rsvp_class(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let (msg, names) = d.reserve_class(
        str_param(p, "class")?,
        numhosts_param(p, "numhosts")?,
        str_param(p, "user")?,
        expire_param(p, "expire")?,
        str_param(p, "msg")?,
        opt_str_param(p, "key")?,
        flag_param(p, "randomize"),
    )?;
    Ok((msg, serde_json::json!(names)))
}

fn h_rsvp_host(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.reserve_host(
        str_param(p, "host")?,
        str_param(p, "user")?,
        expire_param(p, "expire")?,
        str_param(p, "msg")?,
        opt_str_param(p, "key")?,
        flag_param(p, "resource"),
    )?;
    Ok((msg, Value::Null))
}

fn h_verify_rsvp(d: &mut Daemon, p: &Params) -> Result<(String, Value), OpError> {
    let msg = d.verify(str_param(p, "host")?, str_param(p, "user")?)?;
    Ok((msg, Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::config::Config;
    use crate::daemon::notify::LogNotifier;

    fn daemon() -> Daemon {
        Daemon::new(Config::default(), Box::new(LogNotifier))
    }

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn unknown_command_is_rejected() {
        let mut d = daemon();
        let out = dispatch(&mut d, "frobnicate", &Params::new());
        assert!(!out.response.is_success());
        assert!(!out.mutated);
        assert!(out.response.message.contains("unknown command"));
    }

    #[test]
    fn missing_required_parameter() {
        let mut d = daemon();
        let out = dispatch(&mut d, "del_host", &Params::new());
        assert!(!out.response.is_success());
        assert_eq!(out.response.message, "missing required parameter host for del_host");

        // Null counts as missing.
        let out = dispatch(&mut d, "del_host", &params(json!({"host": null})));
        assert!(!out.response.is_success());
    }

    #[test]
    fn unknown_parameter_is_rejected() {
        let mut d = daemon();
        let out = dispatch(
            &mut d,
            "del_host",
            &params(json!({"host": "h1", "bogus": 1})),
        );
        assert!(!out.response.is_success());
        assert_eq!(out.response.message, "unknown parameter bogus for del_host");
    }

    #[test]
    fn optional_parameters_are_accepted() {
        let mut d = daemon();
        dispatch(
            &mut d,
            "add_host",
            &params(json!({"host": "h1", "classes": ["FARM"]})),
        );
        let out = dispatch(
            &mut d,
            "rsvp_host",
            &params(json!({
                "host": "h1", "user": "alice", "expire": "0", "msg": "",
                "key": "k", "resource": 0,
            })),
        );
        assert!(out.response.is_success(), "{}", out.response.message);
        assert!(out.mutated);
        assert_eq!(out.response.message, "reserved h1");
    }

    #[test]
    fn mutated_is_false_on_handler_error() {
        let mut d = daemon();
        let out = dispatch(
            &mut d,
            "rsvp_host",
            &params(json!({"host": "nope", "user": "alice", "expire": 0, "msg": ""})),
        );
        assert!(!out.response.is_success());
        assert!(!out.mutated);
    }

    #[test]
    fn del_next_user_authorizes_the_owner() {
        let mut d = daemon();
        for (cmd, p) in [
            ("add_host", json!({"host": "h1", "classes": []})),
            ("rsvp_host", json!({"host": "h1", "user": "alice", "expire": 0, "msg": ""})),
            ("add_next_user", json!({"host": "h1", "user": "bob", "expire": 0, "msg": ""})),
        ] {
            let out = dispatch(&mut d, cmd, &params(p));
            assert!(out.response.is_success(), "{cmd}: {}", out.response.message);
        }

        // The queued user cannot free the slot; only the owner can.
        let out = dispatch(
            &mut d,
            "del_next_user",
            &params(json!({"host": "h1", "user": "bob"})),
        );
        assert!(!out.response.is_success());
        assert!(!out.mutated);
        assert!(out.response.message.contains("not reserved by bob"));

        let out = dispatch(
            &mut d,
            "del_next_user",
            &params(json!({"host": "h1", "user": "alice"})),
        );
        assert!(out.response.is_success(), "{}", out.response.message);
        assert!(out.mutated);
        assert_eq!(out.response.message, "removed next user bob from h1");
    }

    #[test]
    fn listings_do_not_mutate() {
        let mut d = daemon();
        let out = dispatch(
            &mut d,
            "list_classes",
            &params(json!({"class": ""})),
        );
        assert!(out.response.is_success());
        assert!(!out.mutated);
        let rows = out.response.data.as_array().expect("rows");
        assert_eq!(rows.len(), 2); // ALL and FARM
    }

    #[test]
    fn bad_expire_string_is_rejected() {
        let mut d = daemon();
        dispatch(
            &mut d,
            "add_host",
            &params(json!({"host": "h1", "classes": []})),
        );
        let out = dispatch(
            &mut d,
            "rsvp_host",
            &params(json!({"host": "h1", "user": "alice", "expire": "soon", "msg": ""})),
        );
        assert!(!out.response.is_success());
        assert!(out.response.message.contains("invalid expire"));

        let out = dispatch(
            &mut d,
            "rsvp_host",
            &params(json!({"host": "h1", "user": "alice", "expire": -3, "msg": ""})),
        );
        assert!(!out.response.is_success());
    }

    #[test]
    fn numhosts_must_be_a_positive_count() {
        let mut d = daemon();
        for bad in [json!("1.5"), json!("-1"), json!("x"), json!(0)] {
            let out = dispatch(
                &mut d,
                "rsvp_class",
                &params(json!({
                    "class": "FARM", "numhosts": bad.clone(), "user": "alice",
                    "expire": 0, "msg": "",
                })),
            );
            assert!(!out.response.is_success(), "numhosts {bad} accepted");
        }
    }
}
