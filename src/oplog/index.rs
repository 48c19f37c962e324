//! Index operations collected during replay and built once it is over.

use std::collections::BTreeMap;

use bytes::Bytes;

/// One index to build.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct IndexSpec {
    pub name: String,
    pub spec: Bytes,
}

/// Per-namespace index catalog. Index creation during replay would rebuild
/// an index many times over, so index commands only update the catalog.
#[derive(Debug, Default, Clone)]
pub struct IndexCatalog {
    indexes: BTreeMap<String, Vec<IndexSpec>>,
}

impl IndexCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an index of a namespace.
    pub fn create_index(&mut self, ns: &str, name: &str, spec: Bytes) {
        let list = self.indexes.entry(ns.into()).or_default();
        list.retain(|i| i.name != name);
        list.push(IndexSpec {
            name: name.into(),
            spec,
        });
    }

    /// Drops one index of a namespace, or all of them for `"*"`.
    pub fn drop_index(&mut self, ns: &str, name: &str) {
        if name == "*" {
            self.indexes.remove(ns);
        } else if let Some(list) = self.indexes.get_mut(ns) {
            list.retain(|i| i.name != name);
            if list.is_empty() {
                self.indexes.remove(ns);
            }
        }
    }

    /// Forgets a dropped collection.
    pub fn drop_collection(&mut self, ns: &str) {
        self.indexes.remove(ns);
    }

    /// Indexes left to build, ordered by namespace then creation.
    pub fn queued(&self) -> Vec<(String, IndexSpec)> {
        self.indexes
            .iter()
            .flat_map(|(ns, list)| list.iter().map(|i| (ns.clone(), i.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }
}

#[cfg(test)]
mod index_tests {
    use super::*;

    #[test]
    fn create_drop_sequence() {
        let mut ic = IndexCatalog::new();
        ic.create_index("app.users", "email_1", Bytes::from_static(b"a"));
        ic.create_index("app.users", "age_1", Bytes::from_static(b"b"));
        ic.create_index("app.orders", "ts_1", Bytes::from_static(b"c"));
        ic.create_index("app.users", "email_1", Bytes::from_static(b"d"));
        ic.drop_index("app.users", "age_1");

        let queued = ic.queued();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, "app.orders");
        assert_eq!(queued[1].1.spec, Bytes::from_static(b"d"));

        ic.drop_collection("app.orders");
        ic.drop_index("app.users", "*");
        assert!(ic.is_empty());
    }
}
