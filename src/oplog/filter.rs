//! Namespace selection for oplog replay.

use std::sync::Arc;

use crate::oplog::Op;

/// Caller-supplied predicate deciding whether an operation on a namespace
/// gets applied.
pub type OpFilter = Arc<dyn Fn(&str, &Op) -> bool + Send + Sync>;

/// Namespaces that replay never touches: node-local data and the session /
/// routing caches that the restored cluster rebuilds by itself.
const INTERNAL_NS: &[&str] = &[
    "local.*",
    "config.system.sessions",
    "config.cache.*",
    "config.transactions",
];

fn pattern_matches(pattern: &str, ns: &str) -> bool {
    match pattern.strip_suffix(".*") {
        Some(prefix) => ns
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.is_empty() || rest.starts_with('.')),
        None => pattern == ns,
    }
}

/// True for namespaces excluded from any replay.
pub fn is_internal_ns(ns: &str) -> bool {
    INTERNAL_NS.iter().any(|p| pattern_matches(p, ns))
}

/// Allow-list of namespaces, each either `db.coll` or `db.*`. An empty list
/// allows everything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NsFilter {
    include: Vec<String>,
}

impl NsFilter {
    pub fn new(include: Vec<String>) -> Self {
        NsFilter { include }
    }

    pub fn allows(&self, ns: &str) -> bool {
        self.include.is_empty()
            || self.include.iter().any(|p| pattern_matches(p, ns))
    }
}

#[cfg(test)]
mod filter_tests {
    use super::*;

    #[test]
    fn internal_namespaces() {
        assert!(is_internal_ns("local.oplog.rs"));
        assert!(is_internal_ns("config.system.sessions"));
        assert!(is_internal_ns("config.cache.chunks.db.coll"));
        assert!(!is_internal_ns("config.settings"));
        assert!(!is_internal_ns("localdb.coll"));
        assert!(!is_internal_ns("app.users"));
    }

    #[test]
    fn allow_list() {
        let all = NsFilter::default();
        assert!(all.allows("any.thing"));

        let some = NsFilter::new(vec!["app.users".into(), "logs.*".into()]);
        assert!(some.allows("app.users"));
        assert!(!some.allows("app.orders"));
        assert!(some.allows("logs.2024"));
        assert!(!some.allows("logsx.2024"));
    }
}
