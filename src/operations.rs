use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::{
    ClosureReport, CreateLinkPayload, Link, LinkFilter, LinkKey, NodeId, NodeStatus, Relation,
    ScopeId, UpdateLinkPayload,
};
use crate::relations::NodeLinks;

/// Tool-friendly closure actions against one link table.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum DagOperation {
    AddLink {
        payload: CreateLinkPayload,
    },
    UpdateLink {
        payload: UpdateLinkPayload,
    },
    RemoveLink {
        key: LinkKey,
    },
    GetLink {
        key: LinkKey,
    },
    ListLinks {
        #[serde(default)]
        filter: LinkFilter,
    },
    Related {
        node_id: NodeId,
        relation: Relation,
        #[serde(default)]
        scope_id: Option<ScopeId>,
    },
    NodeStatus {
        node_id: NodeId,
        #[serde(default)]
        scope_id: Option<ScopeId>,
    },
    VerifyClosure {
        #[serde(default)]
        scope_id: Option<ScopeId>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DagOperationResult {
    Link {
        link: Link,
    },
    Links {
        items: Vec<Link>,
    },
    Nodes {
        relation: String,
        node_ids: Vec<NodeId>,
    },
    NodeStatus {
        status: NodeStatus,
    },
    ClosureReport {
        report: ClosureReport,
    },
    Removed,
}

#[derive(Clone)]
pub struct DagOperations {
    pool: Arc<SqlitePool>,
    links: Arc<NodeLinks>,
}

impl DagOperations {
    pub fn new(pool: Arc<SqlitePool>, links: Arc<NodeLinks>) -> Self {
        Self { pool, links }
    }

    pub fn from_pool(pool: &SqlitePool, links: NodeLinks) -> Self {
        Self {
            pool: Arc::new(pool.clone()),
            links: Arc::new(links),
        }
    }

    pub fn pool(&self) -> Arc<SqlitePool> {
        Arc::clone(&self.pool)
    }

    pub fn links(&self) -> Arc<NodeLinks> {
        Arc::clone(&self.links)
    }

    pub async fn execute(&self, operation: DagOperation) -> Result<DagOperationResult> {
        match operation {
            DagOperation::AddLink { payload } => {
                let link = self.add_link(payload).await?;
                Ok(DagOperationResult::Link { link })
            }
            DagOperation::UpdateLink { payload } => {
                let link = self.update_link(payload).await?;
                Ok(DagOperationResult::Link { link })
            }
            DagOperation::RemoveLink { key } => {
                self.remove_link(key).await?;
                Ok(DagOperationResult::Removed)
            }
            DagOperation::GetLink { key } => {
                let link = self.get_link(key).await?;
                Ok(DagOperationResult::Link { link })
            }
            DagOperation::ListLinks { filter } => {
                let items = self.list_links(&filter).await?;
                Ok(DagOperationResult::Links { items })
            }
            DagOperation::Related {
                node_id,
                relation,
                scope_id,
            } => {
                let node_ids = self.related(node_id, relation, scope_id).await?;
                Ok(DagOperationResult::Nodes {
                    relation: self.links.relation_name(relation),
                    node_ids,
                })
            }
            DagOperation::NodeStatus { node_id, scope_id } => {
                let status = self.node_status(node_id, scope_id).await?;
                Ok(DagOperationResult::NodeStatus { status })
            }
            DagOperation::VerifyClosure { scope_id } => {
                let report = self.verify_closure(scope_id).await?;
                Ok(DagOperationResult::ClosureReport { report })
            }
        }
    }

    pub async fn add_link(&self, payload: CreateLinkPayload) -> Result<Link> {
        let record = payload.normalize()?;
        self.links.table().create_link(&self.pool, &record).await
    }

    pub async fn update_link(&self, payload: UpdateLinkPayload) -> Result<Link> {
        self.links
            .table()
            .patch_link(&self.pool, payload.key(), &payload.patch())
            .await
    }

    pub async fn remove_link(&self, key: LinkKey) -> Result<()> {
        self.links.table().destroy_link(&self.pool, key).await
    }

    pub async fn get_link(&self, key: LinkKey) -> Result<Link> {
        self.links.table().get_link(&self.pool, key).await
    }

    pub async fn list_links(&self, filter: &LinkFilter) -> Result<Vec<Link>> {
        self.links.table().list_links(&self.pool, filter).await
    }

    pub async fn related(
        &self,
        node_id: NodeId,
        relation: Relation,
        scope_id: Option<ScopeId>,
    ) -> Result<Vec<NodeId>> {
        let node = self.links.node(node_id);
        match scope_id {
            Some(scope_id) => node.scoped(scope_id).related(&self.pool, relation).await,
            None => node.related(&self.pool, relation).await,
        }
    }

    pub async fn node_status(
        &self,
        node_id: NodeId,
        scope_id: Option<ScopeId>,
    ) -> Result<NodeStatus> {
        let node = self.links.node(node_id);
        match scope_id {
            Some(scope_id) => node.scoped(scope_id).status(&self.pool).await,
            None => node.status(&self.pool).await,
        }
    }

    pub async fn verify_closure(&self, scope_id: Option<ScopeId>) -> Result<ClosureReport> {
        self.links.table().verify_closure(&self.pool, scope_id).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    use super::*;
    use crate::config::LinkTableConfig;
    use crate::db::LinkTable;
    use crate::error::ErrorKind;

    async fn operations() -> DagOperations {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let table = LinkTable::new(&LinkTableConfig::new("Task")).expect("valid config");
        table.create_table(&pool).await.expect("create table");
        DagOperations::from_pool(&pool, NodeLinks::from_table(Arc::new(table)))
    }

    fn operation(value: serde_json::Value) -> DagOperation {
        serde_json::from_value(value).expect("operation should deserialize")
    }

    #[test]
    fn operations_deserialize_from_tagged_json() {
        let node_id = Uuid::new_v4();
        let parsed = operation(json!({
            "operation": "related",
            "node_id": node_id,
            "relation": "self_and_ancestors"
        }));
        assert!(matches!(
            parsed,
            DagOperation::Related {
                relation: Relation::SelfAndAncestors,
                scope_id: None,
                ..
            }
        ));

        let parsed = operation(json!({ "operation": "list_links" }));
        assert!(matches!(parsed, DagOperation::ListLinks { .. }));
    }

    #[tokio::test]
    async fn add_relate_and_remove() {
        let ops = operations().await;
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        for (ancestor, descendant) in [(a, b), (b, c)] {
            let result = ops
                .execute(operation(json!({
                    "operation": "add_link",
                    "payload": { "ancestorId": ancestor, "descendantId": descendant }
                })))
                .await
                .expect("add link");
            assert!(matches!(result, DagOperationResult::Link { link } if link.direct));
        }

        let result = ops
            .execute(operation(json!({
                "operation": "related",
                "node_id": a,
                "relation": "descendants"
            })))
            .await
            .expect("related");
        let DagOperationResult::Nodes { relation, node_ids } = result else {
            panic!("expected nodes result");
        };
        assert_eq!(relation, "descendants");
        assert_eq!(node_ids.len(), 2);

        let result = ops
            .execute(operation(json!({
                "operation": "remove_link",
                "key": { "ancestorId": b, "descendantId": c }
            })))
            .await
            .expect("remove link");
        assert!(matches!(result, DagOperationResult::Removed));

        let report = ops.verify_closure(None).await.expect("verify");
        assert!(report.consistent);
        assert_eq!(report.link_count, 1);
    }

    #[tokio::test]
    async fn protected_fields_are_rejected() {
        let ops = operations().await;
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        let err = ops
            .execute(operation(json!({
                "operation": "add_link",
                "payload": { "ancestorId": a, "descendantId": b, "count": 1 }
            })))
            .await
            .expect_err("count on create");
        assert_eq!(err.kind, ErrorKind::ProtectedField);

        ops.add_link(CreateLinkPayload {
            ancestor_id: NodeId(a),
            descendant_id: NodeId(b),
            scope_id: None,
            count: None,
        })
        .await
        .expect("add link");

        let err = ops
            .execute(operation(json!({
                "operation": "update_link",
                "payload": { "ancestorId": a, "descendantId": b, "count": 0 }
            })))
            .await
            .expect_err("count on update");
        assert_eq!(err.kind, ErrorKind::ProtectedField);

        let err = ops
            .execute(operation(json!({
                "operation": "update_link",
                "payload": { "ancestorId": a, "descendantId": b, "direct": true }
            })))
            .await
            .expect_err("nothing changes");
        assert_eq!(err.code, "link_no_changes");
    }

    #[tokio::test]
    async fn status_of_an_isolated_node() {
        let ops = operations().await;
        let status = ops
            .node_status(NodeId(Uuid::new_v4()), None)
            .await
            .expect("status");
        assert!(status.leaf && status.root);
    }
}
