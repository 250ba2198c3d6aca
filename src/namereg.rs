// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Registry of unique sink and source names.

use crate::error::{Result, SinkError};
use std::collections::HashMap;

pub const NAME_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameKind {
    Sink,
    Source,
}

fn is_valid_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'
}

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= NAME_MAX && name.chars().all(is_valid_char)
}

/// Replaces every invalid character with `_`, truncating to `NAME_MAX`.
pub fn make_valid_name(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }
    Some(
        name.chars()
            .take(NAME_MAX)
            .map(|c| if is_valid_char(c) { c } else { '_' })
            .collect(),
    )
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: NameKind,
    index: u32,
}

#[derive(Debug, Default)]
pub struct NameRegistry {
    entries: HashMap<String, Entry>,
}

impl NameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name` for the object `index` and returns the name that was
    /// actually registered.
    ///
    /// With `fail` set, an invalid or taken name is an error. Otherwise the
    /// name is sanitised and, if taken, suffixed with `.2` through `.99`.
    pub fn register(&mut self, name: &str, kind: NameKind, index: u32, fail: bool) -> Result<String> {
        if name.is_empty() {
            return Err(SinkError::InvalidName(name.to_string()));
        }

        let mut candidate = if is_valid_name(name) {
            name.to_string()
        } else if fail {
            return Err(SinkError::InvalidName(name.to_string()));
        } else {
            make_valid_name(name).ok_or_else(|| SinkError::InvalidName(name.to_string()))?
        };

        if self.entries.contains_key(&candidate) {
            if fail {
                return Err(SinkError::NameTaken(candidate));
            }
            if candidate.len() + 3 > NAME_MAX {
                return Err(SinkError::NameTaken(candidate));
            }

            let base = candidate;
            candidate = (2..=99)
                .map(|i| format!("{}.{}", base, i))
                .find(|k| !self.entries.contains_key(k))
                .ok_or(SinkError::NameTaken(base))?;
        }

        self.entries
            .insert(candidate.clone(), Entry { kind, index });
        Ok(candidate)
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    pub fn get(&self, name: &str, kind: NameKind) -> Option<u32> {
        self.entries
            .get(name)
            .filter(|e| e.kind == kind)
            .map(|e| e.index)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixes_taken_names() {
        let mut reg = NameRegistry::new();
        assert_eq!(reg.register("out", NameKind::Sink, 0, false).unwrap(), "out");
        assert_eq!(reg.register("out", NameKind::Sink, 1, false).unwrap(), "out.2");
        assert_eq!(reg.register("out", NameKind::Sink, 2, false).unwrap(), "out.3");
        assert_eq!(reg.get("out.2", NameKind::Sink), Some(1));
        assert_eq!(reg.get("out.2", NameKind::Source), None);
    }

    #[test]
    fn test_fail_mode_rejects() {
        let mut reg = NameRegistry::new();
        reg.register("out", NameKind::Sink, 0, true).unwrap();
        assert_eq!(
            reg.register("out", NameKind::Sink, 1, true),
            Err(SinkError::NameTaken("out".into()))
        );
        assert!(matches!(
            reg.register("bad name", NameKind::Sink, 1, true),
            Err(SinkError::InvalidName(_))
        ));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_sanitises_invalid_names() {
        let mut reg = NameRegistry::new();
        let name = reg.register("my sink/1", NameKind::Sink, 0, false).unwrap();
        assert_eq!(name, "my_sink_1");
        assert!(reg.unregister(&name));
        assert!(reg.is_empty());
    }
}
