use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

/// A stable identifier derived from a (scope, name) pair.
///
/// The filesystem workspace has no database to hand out ids, so projects
/// and documents are identified by hashing their location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableId {
    /// The numeric ID used as the key in redb tables and the index.
    pub numeric: u64,
    /// The short hex string for human display (e.g. "a1b2c3").
    pub short: String,
}

impl StableId {
    pub fn new(scope: &str, name: &str) -> Self {
        let numeric = Self::hash_pair(scope, name);
        let short = Self::short_hex(numeric, 6);
        Self { numeric, short }
    }

    /// Identifier of a project from its name.
    pub fn project(name: &str) -> Self {
        Self::new("project", name)
    }

    /// Identifier of a source document inside a project.
    pub fn source(project: &str, relative_path: &str) -> Self {
        Self::new(&format!("source:{project}"), relative_path)
    }

    /// Identifier of a user's annotation document for a source document.
    pub fn annotation(source: u64, user: &str) -> Self {
        Self::new(&format!("annotation:{source:016x}"), user)
    }

    fn hash_pair(scope: &str, name: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        scope.hash(&mut hasher);
        name.hash(&mut hasher);
        hasher.finish()
    }

    fn short_hex(value: u64, len: usize) -> String {
        let full = format!("{value:016x}");
        full[..len].to_string()
    }
}

impl std::fmt::Display for StableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.short)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(StableId::project("corpus"), StableId::project("corpus"));
    }

    #[test]
    fn scopes_do_not_collide() {
        let a = StableId::source("corpus", "a.txt");
        let b = StableId::source("other", "a.txt");
        assert_ne!(a.numeric, b.numeric);

        let c = StableId::annotation(a.numeric, "alice");
        let d = StableId::annotation(a.numeric, "bob");
        assert_ne!(c.numeric, d.numeric);
    }

    #[test]
    fn display_has_hash_prefix() {
        let id = StableId::project("corpus");
        let s = id.to_string();
        assert!(s.starts_with('#'));
        assert_eq!(s.len(), 7);
    }
}
