pub mod algorithms;
#[cfg(feature = "api")]
pub mod api;
pub mod closure;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod invariants;
pub mod link;
pub mod models;
#[cfg(feature = "sqlx")]
pub mod operations;
#[cfg(feature = "sqlx")]
pub mod relations;

pub mod prelude {
    pub use crate::algorithms::{closure_violations, direct_adjacency, path_counts};
    #[cfg(feature = "api")]
    pub use crate::api::{DagApp, HasPool};
    pub use crate::closure::{ClosureSnapshot, LinkMutation, plan_create, plan_destroy, plan_update};
    pub use crate::config::{LinkSchema, LinkTableConfig};
    #[cfg(feature = "sqlx")]
    pub use crate::db::LinkTable;
    pub use crate::error::{ErrorKind, LibError, Result};
    pub use crate::invariants::{
        LinkLookup, create_violations, destroy_violations, ensure_creatable, ensure_destroyable,
        ensure_updatable, update_violations,
    };
    pub use crate::link::{LinkField, LinkRecord};
    pub use crate::models::{
        ClosureReport, ClosureViolation, CreateLinkPayload, Directness, Link, LinkFilter, LinkKey,
        LinkPatch, LinkViolation, NodeId, NodeStatus, Relation, ScopeId, ScopeQuery,
        UpdateLinkPayload,
    };
    #[cfg(feature = "sqlx")]
    pub use crate::operations::{DagOperation, DagOperationResult, DagOperations};
    #[cfg(feature = "sqlx")]
    pub use crate::relations::{NodeLinks, NodeLinksConfig, NodeView};
}
