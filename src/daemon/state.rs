//! Durable state: the full-model snapshot file.
//!
//! The entire registry is rewritten after every mutation: serialize to the
//! sibling `${state_file}.new`, then rename over the state file so a crash
//! leaves either the old snapshot or the new one, never a torn write.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::Registry;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Load the registry from disk; `None` when no snapshot exists yet.
pub fn load(path: &Path) -> Result<Option<Registry>, StateError> {
    let contents = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StateError::Read {
                path: path.to_path_buf(),
                source: e,
            });
        }
    };
    let registry = serde_json::from_slice(&contents).map_err(|e| StateError::Parse {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(Some(registry))
}

/// Write the full snapshot through `${path}.new` + rename.
pub fn save(path: &Path, registry: &Registry) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(registry).map_err(StateError::Encode)?;

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".new");
    let tmp_path = PathBuf::from(tmp_path);

    fs::write(&tmp_path, &bytes).map_err(|e| StateError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;
    fs::rename(&tmp_path, path).map_err(|e| StateError::Write {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::{Class, Host};

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts.state");
        assert!(load(&path).unwrap().is_none());
    }

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hosts.state");

        let mut registry = Registry::default();
        registry.ensure_defaults();
        registry
            .classes
            .insert("web".into(), Class::atomic("web", "web tier"));
        let mut host = Host::new("h1", vec!["ALL".into(), "web".into()], 100);
        host.reserve("alice", 200, "work", Some("k"));
        host.next_user = Some("bob".into());
        host.next_msg = "mine".into();
        registry.hosts.insert("h1".into(), host);

        save(&path, &registry).expect("save");
        // The temp sibling never survives a successful save.
        assert!(!path.with_extension("state.new").exists());

        let loaded = load(&path).expect("load").expect("snapshot");
        assert_eq!(loaded.classes.len(), registry.classes.len());
        let h1 = loaded.host("h1").expect("h1");
        assert!(h1.is_reserved_by("alice"));
        assert_eq!(h1.expiry, 200);
        assert_eq!(h1.key.as_deref(), Some("k"));
        assert_eq!(h1.next_user.as_deref(), Some("bob"));
        assert_eq!(h1.last_ping_time, 100);
    }
}
