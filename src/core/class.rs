//! Classes: named groups of hosts.
//!
//! An atomic class is a tag hosts carry directly. A composite class holds
//! member class names and matches the intersection of its members'
//! extensions. A resource class tags non-pingable resources and never has
//! members.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// The default class; every host added without classes lands here.
/// Undeletable.
pub const ALL: &str = "ALL";

/// The default reserve class; `rsvp_class` with no class draws from here.
pub const FARM: &str = "FARM";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    pub description: String,
    pub resource: bool,
    /// Member class names; non-empty only for composite classes.
    #[serde(default)]
    pub members: Vec<String>,
}

impl Class {
    pub fn atomic(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            resource: false,
            members: Vec::new(),
        }
    }

    pub fn resource(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            resource: true,
            members: Vec::new(),
        }
    }

    pub fn composite(
        name: impl Into<String>,
        description: impl Into<String>,
        members: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            resource: false,
            members,
        }
    }

    pub fn is_composite(&self) -> bool {
        !self.members.is_empty()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Class names are `\w+` tokens.
pub fn valid_class_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\w+$").expect("static regex"))
        .is_match(name)
}

/// Class ordering: member count ascending, then name ascending.
pub fn class_order(a: &Class, b: &Class) -> Ordering {
    a.members
        .len()
        .cmp(&b.members.len())
        .then_with(|| a.name.cmp(&b.name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_class_name("web"));
        assert!(valid_class_name("tier_2"));
        assert!(!valid_class_name("web tier"));
        assert!(!valid_class_name("a.b"));
        assert!(!valid_class_name(""));
    }

    #[test]
    fn ordering_by_member_count_then_name() {
        let a = Class::atomic("zeta", "");
        let b = Class::atomic("alpha", "");
        let c = Class::composite("beta", "", vec!["alpha".into(), "zeta".into()]);

        let mut classes = vec![c.clone(), a.clone(), b.clone()];
        classes.sort_by(class_order);
        let names: Vec<&str> = classes.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["alpha", "zeta", "beta"]);
    }
}
