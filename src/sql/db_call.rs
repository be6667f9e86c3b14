//! Compiled query descriptors.

use crate::sql::parser::{ParamMapping, RewriteResult, parse_sql};
use crate::sql::source::SourceUnit;
use serde::Serialize;
use sha1::{Digest, Sha1};

/// PostgreSQL truncates identifiers longer than this.
pub const MAX_PREPARED_NAME_LEN: usize = 63;

/// Name given to every ad hoc `query()` call.
pub const RAW_QUERY_NAME: &str = "raw_query";

const PREPARED_HASH_LEN: usize = 16;

/// An immutable, compiled query unit.
///
/// Built once per source at load time, or once per call for raw queries, and
/// shared read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DbCall {
    pub name: String,
    pub key: String,
    /// Original SQL text, used in diagnostics
    pub text: String,
    pub parameterized_sql: String,
    pub mapping: Vec<ParamMapping>,
    pub prepared: bool,
    /// Set only when `prepared` is true
    pub prepared_name: Option<String>,
}

impl DbCall {
    /// Compile a loaded source.
    pub fn from_source(source: &SourceUnit, prepared: bool) -> Self {
        let parsed = parse_sql(&source.text);
        Self::new(
            source.name.clone(),
            source.key.clone(),
            source.text.clone(),
            parsed,
            prepared,
        )
    }

    /// Compile ad hoc SQL text. Raw calls are never prepared.
    pub fn raw(text: &str) -> Self {
        let parsed = parse_sql(text);
        let key = sha1_hex(parsed.parameterized_sql.as_bytes());
        Self::new(
            RAW_QUERY_NAME.to_string(),
            key,
            text.to_string(),
            parsed,
            false,
        )
    }

    fn new(name: String, key: String, text: String, parsed: RewriteResult, prepared: bool) -> Self {
        let prepared_name = prepared.then(|| prepared_name(&name, &parsed.parameterized_sql));
        Self {
            name,
            key,
            text,
            parameterized_sql: parsed.parameterized_sql,
            mapping: parsed.mapping,
            prepared,
            prepared_name,
        }
    }

    /// Parameter names in positional order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.mapping.iter().map(|m| m.name.as_str())
    }
}

fn sha1_hex(input: &[u8]) -> String {
    hex::encode(Sha1::digest(input))
}

/// `{name}_{hash}` within the PostgreSQL identifier limit.
///
/// Long names are shortened before the hash is appended, so names sharing a
/// long prefix still get distinct statements.
fn prepared_name(name: &str, parameterized_sql: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(name.as_bytes());
    hasher.update(parameterized_sql.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let mut end = name.len().min(MAX_PREPARED_NAME_LEN - 1 - PREPARED_HASH_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}_{}", &name[..end], &digest[..PREPARED_HASH_LEN])
}
