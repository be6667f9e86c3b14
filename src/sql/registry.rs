//! Named query registry.

use crate::error::{DbError, DbResult};
use crate::sql::db_call::DbCall;
use crate::sql::source::SourceUnit;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

/// Compiled named queries, looked up by dotted key.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    calls: BTreeMap<String, Arc<DbCall>>,
}

impl QueryRegistry {
    /// Compile every source, failing if two of them share a name.
    ///
    /// All conflicting sources are reported at once, including the first
    /// occurrence of each duplicated name, and nothing is registered.
    pub fn build(sources: &[SourceUnit], use_prepared_statements: bool) -> DbResult<Self> {
        let mut by_name: HashMap<&str, Vec<&SourceUnit>> = HashMap::new();
        for source in sources {
            by_name.entry(source.name.as_str()).or_default().push(source);
        }

        // Report in load order
        let mut conflicts = Vec::new();
        for source in sources {
            if by_name.get(source.name.as_str()).is_some_and(|s| s.len() > 1) {
                conflicts.push(source.relative_path.clone());
            }
        }
        if !conflicts.is_empty() {
            return Err(DbError::DuplicateName { conflicts });
        }

        let calls: BTreeMap<String, Arc<DbCall>> = sources
            .iter()
            .map(|source| {
                let call = DbCall::from_source(source, use_prepared_statements);
                (call.key.clone(), Arc::new(call))
            })
            .collect();

        info!(
            count = calls.len(),
            prepared = use_prepared_statements,
            "Compiled named queries"
        );

        Ok(Self { calls })
    }

    /// Look up a compiled query by key.
    pub fn get(&self, key: &str) -> Option<Arc<DbCall>> {
        self.calls.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.calls.contains_key(key)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.calls.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_registers_by_key() {
        let sources = vec![
            SourceUnit::inline("a.insert", "INSERT INTO a (text) VALUES (:text)"),
            SourceUnit::inline("a.select", "SELECT * FROM a"),
        ];
        let registry = QueryRegistry::build(&sources, false).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("a.insert"));
        assert!(!registry.contains("a_insert"));
        assert_eq!(
            registry.get("a.insert").unwrap().parameterized_sql,
            "INSERT INTO a (text) VALUES ($1)"
        );
        assert_eq!(registry.keys().collect::<Vec<_>>(), vec!["a.insert", "a.select"]);
    }

    #[test]
    fn test_build_reports_every_conflict() {
        // "a_b.c" and "a.b_c" both compile to the name "a_b_c"
        let sources = vec![
            SourceUnit::inline("a_b.c", "SELECT 1"),
            SourceUnit::inline("other", "SELECT 2"),
            SourceUnit::inline("a.b_c", "SELECT 3"),
        ];
        let err = QueryRegistry::build(&sources, false).unwrap_err();

        match err {
            DbError::DuplicateName { conflicts } => {
                assert_eq!(conflicts, vec!["a_b.c", "a.b_c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_applies_prepared_flag() {
        let sources = vec![SourceUnit::inline("q", "SELECT :x")];
        let registry = QueryRegistry::build(&sources, true).unwrap();
        let call = registry.get("q").unwrap();
        assert!(call.prepared);
        assert!(call.prepared_name.is_some());
    }

    #[test]
    fn test_empty_registry() {
        let registry = QueryRegistry::build(&[], false).unwrap();
        assert!(registry.is_empty());
        assert!(registry.get("missing").is_none());
    }
}
