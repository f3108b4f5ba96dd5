//! Relation accessors for a node type.
//!
//! A node class gets its ancestor, descendant, parent and child queries by
//! holding a [`NodeLinks`] bound to one link table. The prefix namespaces the
//! relation names when a node class takes part in several link tables
//! (`category_ancestors`, `tag_ancestors`, ...).

use std::sync::Arc;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::db::LinkTable;
use crate::error::{LibError, Result};
use crate::models::{NodeId, NodeStatus, Relation, ScopeId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeLinksConfig {
    /// Name of the link table the relations read from.
    pub link_table: Option<String>,
    pub prefix: String,
}

impl NodeLinksConfig {
    pub fn new(link_table: impl Into<String>) -> Self {
        Self {
            link_table: Some(link_table.into()),
            prefix: String::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct NodeLinks {
    prefix: String,
    table: Arc<LinkTable>,
}

impl NodeLinks {
    /// Binds to the configured table from `tables`.
    pub fn new(config: &NodeLinksConfig, tables: &[Arc<LinkTable>]) -> Result<Self> {
        let Some(table_name) = config.link_table.as_deref() else {
            return Err(LibError::configuration(
                "Node relations must name a link table",
                anyhow!("node links configured without link_table"),
            ));
        };
        let table = tables
            .iter()
            .find(|table| table.name() == table_name)
            .cloned()
            .ok_or_else(|| {
                LibError::configuration(
                    "Node relations name an unknown link table",
                    anyhow!("link table '{}' is not configured", table_name),
                )
            })?;

        Ok(Self {
            prefix: config.prefix.clone(),
            table,
        })
    }

    pub fn from_table(table: Arc<LinkTable>) -> Self {
        Self {
            prefix: String::new(),
            table,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn table(&self) -> &LinkTable {
        &self.table
    }

    /// Relation name with the prefix applied, e.g. `category_parents`.
    pub fn relation_name(&self, relation: Relation) -> String {
        if self.prefix.is_empty() {
            relation.as_str().to_string()
        } else {
            format!("{}_{}", self.prefix, relation.as_str())
        }
    }

    pub fn node(&self, node_id: NodeId) -> NodeView<'_> {
        NodeView {
            links: self,
            node_id,
            scope_id: None,
        }
    }
}

/// One node seen through a [`NodeLinks`], optionally restricted to a scope.
#[derive(Debug, Clone, Copy)]
pub struct NodeView<'a> {
    links: &'a NodeLinks,
    node_id: NodeId,
    scope_id: Option<ScopeId>,
}

impl NodeView<'_> {
    pub fn scoped(self, scope_id: ScopeId) -> Self {
        Self {
            scope_id: Some(scope_id),
            ..self
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn scope_id(&self) -> Option<ScopeId> {
        self.scope_id
    }

    pub async fn related(&self, pool: &SqlitePool, relation: Relation) -> Result<Vec<NodeId>> {
        self.links
            .table
            .related_nodes(pool, self.node_id, relation, self.scope_id)
            .await
    }

    pub async fn ancestors(&self, pool: &SqlitePool) -> Result<Vec<NodeId>> {
        self.related(pool, Relation::Ancestors).await
    }

    pub async fn descendants(&self, pool: &SqlitePool) -> Result<Vec<NodeId>> {
        self.related(pool, Relation::Descendants).await
    }

    pub async fn parents(&self, pool: &SqlitePool) -> Result<Vec<NodeId>> {
        self.related(pool, Relation::Parents).await
    }

    pub async fn children(&self, pool: &SqlitePool) -> Result<Vec<NodeId>> {
        self.related(pool, Relation::Children).await
    }

    pub async fn self_and_ancestors(&self, pool: &SqlitePool) -> Result<Vec<NodeId>> {
        self.related(pool, Relation::SelfAndAncestors).await
    }

    pub async fn self_and_descendants(&self, pool: &SqlitePool) -> Result<Vec<NodeId>> {
        self.related(pool, Relation::SelfAndDescendants).await
    }

    /// No outgoing links.
    pub async fn is_leaf(&self, pool: &SqlitePool) -> Result<bool> {
        let has_children = self
            .links
            .table
            .has_links(pool, self.node_id, true, self.scope_id)
            .await?;
        Ok(!has_children)
    }

    /// No incoming links.
    pub async fn is_root(&self, pool: &SqlitePool) -> Result<bool> {
        let has_parents = self
            .links
            .table
            .has_links(pool, self.node_id, false, self.scope_id)
            .await?;
        Ok(!has_parents)
    }

    pub async fn status(&self, pool: &SqlitePool) -> Result<NodeStatus> {
        Ok(NodeStatus {
            node_id: self.node_id,
            scope_id: self.scope_id,
            leaf: self.is_leaf(pool).await?,
            root: self.is_root(pool).await?,
        })
    }
}
