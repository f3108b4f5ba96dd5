use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ErrorKind, LibError};
use crate::models::{
    CreateLinkPayload, LinkFilter, LinkKey, NodeId, Relation, ScopeId, ScopeQuery,
    UpdateLinkPayload,
};
use crate::relations::NodeLinks;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.0.kind {
            ErrorKind::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Corrupted => StatusCode::CONFLICT,
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::ProtectedField => StatusCode::UNPROCESSABLE_ENTITY,
        };

        tracing::error!(
            kind = ?self.0.kind,
            code = self.0.code,
            error = %self.0.source,
            "dag api request failed"
        );
        let body = json!({
            "code": self.0.code,
            "message": self.0.public,
            "violations": self.0.violations,
        });
        (status, Json(body)).into_response()
    }
}

pub trait HasPool {
    fn pool(&self) -> Arc<sqlx::SqlitePool>;
}

pub trait DagApp: HasPool {
    fn node_links(&self) -> Arc<NodeLinks>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkKeyQuery {
    ancestor_id: NodeId,
    descendant_id: NodeId,
    scope_id: Option<ScopeId>,
}

impl From<LinkKeyQuery> for LinkKey {
    fn from(value: LinkKeyQuery) -> Self {
        LinkKey::new(value.ancestor_id, value.descendant_id, value.scope_id)
    }
}

async fn create_link_handler<S>(
    State(app): State<S>,
    Json(payload): Json<CreateLinkPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    let record = payload.normalize()?;
    let link = app
        .node_links()
        .table()
        .create_link(&app.pool(), &record)
        .await?;
    Ok((StatusCode::CREATED, Json(link)))
}

async fn list_links_handler<S>(
    State(app): State<S>,
    Query(filter): Query<LinkFilter>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    let links = app
        .node_links()
        .table()
        .list_links(&app.pool(), &filter)
        .await?;
    Ok(Json(links))
}

async fn update_link_handler<S>(
    State(app): State<S>,
    Json(payload): Json<UpdateLinkPayload>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    let link = app
        .node_links()
        .table()
        .patch_link(&app.pool(), payload.key(), &payload.patch())
        .await?;
    Ok(Json(link))
}

async fn delete_link_handler<S>(
    State(app): State<S>,
    Query(key): Query<LinkKeyQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    app.node_links()
        .table()
        .destroy_link(&app.pool(), key.into())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn node_status_handler<S>(
    State(app): State<S>,
    Path(node_id): Path<NodeId>,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    let links = app.node_links();
    let node = links.node(node_id);
    let status = match query.scope_id {
        Some(scope_id) => node.scoped(scope_id).status(&app.pool()).await?,
        None => node.status(&app.pool()).await?,
    };
    Ok(Json(status))
}

async fn related_nodes_handler<S>(
    State(app): State<S>,
    Path((node_id, relation)): Path<(NodeId, String)>,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    let relation = relation.parse::<Relation>()?;
    let links = app.node_links();
    let node = links.node(node_id);
    let node_ids = match query.scope_id {
        Some(scope_id) => node.scoped(scope_id).related(&app.pool(), relation).await?,
        None => node.related(&app.pool(), relation).await?,
    };
    Ok(Json(json!({
        "relation": links.relation_name(relation),
        "nodeIds": node_ids,
    })))
}

async fn verify_closure_handler<S>(
    State(app): State<S>,
    Query(query): Query<ScopeQuery>,
) -> Result<impl IntoResponse, AppError>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    let report = app
        .node_links()
        .table()
        .verify_closure(&app.pool(), query.scope_id)
        .await?;
    Ok(Json(report))
}

pub fn routes<S>() -> Router<S>
where
    S: DagApp + Clone + Send + Sync + 'static,
{
    tracing::info!("Registering route /dag/links [GET,POST,PATCH,DELETE]");
    tracing::info!("Registering route /dag/nodes/{{node_id}}/status [GET]");
    tracing::info!("Registering route /dag/nodes/{{node_id}}/{{relation}} [GET]");
    tracing::info!("Registering route /dag/closure [GET]");

    Router::new()
        .route(
            "/dag/links",
            get(list_links_handler::<S>)
                .post(create_link_handler::<S>)
                .patch(update_link_handler::<S>)
                .delete(delete_link_handler::<S>),
        )
        .route("/dag/nodes/{node_id}/status", get(node_status_handler::<S>))
        .route(
            "/dag/nodes/{node_id}/{relation}",
            get(related_nodes_handler::<S>),
        )
        .route("/dag/closure", get(verify_closure_handler::<S>))
}
