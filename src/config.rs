//! Per-link-table configuration.
//!
//! A [`LinkTableConfig`] is plain data (deserializable from JSON or any serde
//! format). [`LinkSchema`] is the validated, immutable form every storage
//! operation works from.

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::error::{LibError, Result};
use crate::models::ScopeId;

pub const DEFAULT_TABLE: &str = "dag_links";
pub const DEFAULT_ANCESTOR_ID_COLUMN: &str = "ancestor_id";
pub const DEFAULT_DESCENDANT_ID_COLUMN: &str = "descendant_id";
pub const DEFAULT_DIRECT_COLUMN: &str = "direct";
pub const DEFAULT_COUNT_COLUMN: &str = "count";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinkTableConfig {
    pub table: String,
    /// Name of the node type both ends of a link point to.
    pub node_class: Option<String>,
    pub ancestor_id_column: String,
    pub descendant_id_column: String,
    pub direct_column: String,
    pub count_column: String,
    /// When set, links are partitioned into independent closures by this column.
    pub scope_column: Option<String>,
}

impl Default for LinkTableConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_string(),
            node_class: None,
            ancestor_id_column: DEFAULT_ANCESTOR_ID_COLUMN.to_string(),
            descendant_id_column: DEFAULT_DESCENDANT_ID_COLUMN.to_string(),
            direct_column: DEFAULT_DIRECT_COLUMN.to_string(),
            count_column: DEFAULT_COUNT_COLUMN.to_string(),
            scope_column: None,
        }
    }
}

impl LinkTableConfig {
    pub fn new(node_class: impl Into<String>) -> Self {
        Self {
            node_class: Some(node_class.into()),
            ..Self::default()
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_scope_column(mut self, column: impl Into<String>) -> Self {
        self.scope_column = Some(column.into());
        self
    }

    pub fn validate(&self) -> Result<LinkSchema> {
        LinkSchema::from_config(self)
    }
}

/// Validated table layout. Identifiers are restricted to ASCII letters, digits
/// and underscores so they can be spliced into SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSchema {
    table: String,
    node_class: String,
    ancestor_id: String,
    descendant_id: String,
    direct: String,
    count: String,
    scope: Option<String>,
}

impl LinkSchema {
    pub fn from_config(config: &LinkTableConfig) -> Result<Self> {
        let node_class = match config.node_class.as_deref().map(str::trim) {
            Some(node_class) if !node_class.is_empty() => node_class.to_string(),
            _ => {
                return Err(LibError::configuration(
                    "Link tables must name the node class their links point to",
                    anyhow!("link table '{}' has no node_class", config.table),
                ));
            }
        };

        let table = identifier("table", &config.table)?;
        let ancestor_id = identifier("ancestor_id_column", &config.ancestor_id_column)?;
        let descendant_id = identifier("descendant_id_column", &config.descendant_id_column)?;
        let direct = identifier("direct_column", &config.direct_column)?;
        let count = identifier("count_column", &config.count_column)?;
        let scope = config
            .scope_column
            .as_deref()
            .map(|column| identifier("scope_column", column))
            .transpose()?;

        let mut columns = vec![&ancestor_id, &descendant_id, &direct, &count];
        columns.extend(scope.as_ref());
        for (idx, column) in columns.iter().enumerate() {
            if columns[..idx].contains(column) {
                return Err(LibError::configuration(
                    "Link table columns must be distinct",
                    anyhow!("column '{}' configured twice on '{}'", column, table),
                ));
            }
        }

        Ok(Self {
            table,
            node_class,
            ancestor_id,
            descendant_id,
            direct,
            count,
            scope,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn node_class(&self) -> &str {
        &self.node_class
    }

    pub fn ancestor_id_column(&self) -> &str {
        &self.ancestor_id
    }

    pub fn descendant_id_column(&self) -> &str {
        &self.descendant_id
    }

    pub fn direct_column(&self) -> &str {
        &self.direct
    }

    pub fn count_column(&self) -> &str {
        &self.count
    }

    pub fn scope_column(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    /// Writes must carry a scope exactly when the table is scoped.
    pub fn check_write_scope(&self, scope_id: Option<ScopeId>) -> Result<()> {
        match (self.is_scoped(), scope_id) {
            (true, None) => Err(LibError::invalid(
                "Scope is required for this link table",
                anyhow!("link table '{}' is scoped but no scope was given", self.table),
            )),
            (false, Some(scope_id)) => Err(not_scoped(&self.table, scope_id)),
            _ => Ok(()),
        }
    }

    /// Reads may omit the scope on a scoped table to span every scope.
    pub fn check_read_scope(&self, scope_id: Option<ScopeId>) -> Result<()> {
        match (self.is_scoped(), scope_id) {
            (false, Some(scope_id)) => Err(not_scoped(&self.table, scope_id)),
            _ => Ok(()),
        }
    }
}

fn not_scoped(table: &str, scope_id: ScopeId) -> LibError {
    LibError::invalid(
        "This link table is not scoped",
        anyhow!("scope {} given for unscoped link table '{}'", scope_id, table),
    )
}

fn identifier(option: &'static str, value: &str) -> Result<String> {
    let mut chars = value.chars();
    let valid = chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');

    if valid {
        Ok(value.to_string())
    } else {
        Err(LibError::configuration(
            "Link table identifiers must be plain SQL identifiers",
            anyhow!("invalid {} '{}'", option, value),
        ))
    }
}
