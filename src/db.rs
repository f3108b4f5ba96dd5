use std::collections::BTreeMap;

use anyhow::anyhow;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::algorithms::closure_violations;
use crate::closure::{self, ClosureSnapshot, LinkMutation};
use crate::config::{LinkSchema, LinkTableConfig};
use crate::error::{LibError, Result};
use crate::invariants::LinkLookup;
use crate::link::LinkRecord;
use crate::models::{
    ClosureReport, Directness, Link, LinkFilter, LinkKey, LinkPatch, LinkViolation, NodeId,
    Relation, ScopeId,
};

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Debug, Clone, FromRow)]
struct LinkRow {
    ancestor_id: Uuid,
    descendant_id: Uuid,
    direct: bool,
    link_count: i64,
    scope_id: Option<Uuid>,
}

impl From<LinkRow> for Link {
    fn from(value: LinkRow) -> Self {
        Self {
            ancestor_id: NodeId(value.ancestor_id),
            descendant_id: NodeId(value.descendant_id),
            direct: value.direct,
            count: value.link_count,
            scope_id: value.scope_id.map(ScopeId),
        }
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

fn quoted(identifier: &str) -> String {
    format!("\"{}\"", identifier)
}

/// A closure table in SQLite. Every mutation runs in one transaction: the
/// neighbourhood of the edge is loaded, the change is planned in memory, and
/// the planned row changes are written back. Any failure rolls everything back.
#[derive(Debug, Clone)]
pub struct LinkTable {
    schema: LinkSchema,
}

impl LinkTable {
    pub fn new(config: &LinkTableConfig) -> Result<Self> {
        Ok(Self {
            schema: LinkSchema::from_config(config)?,
        })
    }

    pub fn schema(&self) -> &LinkSchema {
        &self.schema
    }

    pub fn name(&self) -> &str {
        self.schema.table()
    }

    fn table(&self) -> String {
        quoted(self.schema.table())
    }

    fn ancestor(&self) -> String {
        quoted(self.schema.ancestor_id_column())
    }

    fn descendant(&self) -> String {
        quoted(self.schema.descendant_id_column())
    }

    fn direct(&self) -> String {
        quoted(self.schema.direct_column())
    }

    fn count(&self) -> String {
        quoted(self.schema.count_column())
    }

    fn scope(&self) -> Option<String> {
        self.schema.scope_column().map(quoted)
    }

    fn select_columns(&self) -> String {
        format!(
            "{} AS ancestor_id, {} AS descendant_id, {} AS direct, {} AS link_count, {} AS scope_id",
            self.ancestor(),
            self.descendant(),
            self.direct(),
            self.count(),
            self.scope().unwrap_or_else(|| "NULL".to_string()),
        )
    }

    /// `AND scope = $param` for scoped tables, nothing otherwise.
    fn scope_filter(&self, param: usize) -> String {
        match self.scope() {
            Some(scope) => format!(" AND {} = ${}", scope, param),
            None => String::new(),
        }
    }

    /// Matches one link, binding ancestor, descendant and scope from `$first`.
    fn key_clause(&self, first: usize) -> String {
        format!(
            "{} = ${} AND {} = ${}{}",
            self.ancestor(),
            first,
            self.descendant(),
            first + 1,
            self.scope_filter(first + 2)
        )
    }

    fn bind_key<'q>(&self, query: SqliteQuery<'q>, key: LinkKey) -> SqliteQuery<'q> {
        let query = query.bind(key.ancestor_id.0).bind(key.descendant_id.0);
        match key.scope_id {
            Some(scope_id) if self.schema.is_scoped() => query.bind(scope_id.0),
            _ => query,
        }
    }

    pub async fn create_table(&self, pool: &SqlitePool) -> Result<()> {
        let scope_column = self
            .scope()
            .map(|scope| format!("{} BLOB NOT NULL,\n", scope))
            .unwrap_or_default();
        let scope_index = self
            .scope()
            .map(|scope| format!(", {}", scope))
            .unwrap_or_default();

        let statements = [
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    {ancestor} BLOB NOT NULL,
                    {descendant} BLOB NOT NULL,
                    {direct} BOOLEAN NOT NULL,
                    {count} INTEGER NOT NULL DEFAULT 0,
                    {scope_column}
                    CHECK ({ancestor} <> {descendant}),
                    CHECK ({count} >= 0),
                    CHECK ({direct} = 1 OR {count} >= 1)
                )
                "#,
                table = self.table(),
                ancestor = self.ancestor(),
                descendant = self.descendant(),
                direct = self.direct(),
                count = self.count(),
                scope_column = scope_column,
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({}, {}{})",
                quoted(&format!("{}_endpoints", self.schema.table())),
                self.table(),
                self.ancestor(),
                self.descendant(),
                scope_index,
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({}{})",
                quoted(&format!("{}_descendant", self.schema.table())),
                self.table(),
                self.descendant(),
                scope_index,
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|err| db_err("Failed to create link table", err))?;
        }

        tracing::info!(table = self.name(), "link table ready");
        Ok(())
    }

    async fn fetch_link<'e, E>(&self, executor: E, key: LinkKey) -> Result<Option<Link>>
    where
        E: sqlx::Executor<'e, Database = Sqlite>,
    {
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            self.select_columns(),
            self.table(),
            self.key_clause(1)
        );
        let row = self
            .bind_key(sqlx::query(&sql), key)
            .fetch_optional(executor)
            .await
            .map_err(|err| db_err("Failed to query link", err))?;

        row.map(|row| LinkRow::from_row(&row).map(Link::from))
            .transpose()
            .map_err(|err| db_err("Failed to read link", err))
    }

    pub async fn find_link(&self, pool: &SqlitePool, key: LinkKey) -> Result<Option<Link>> {
        self.schema.check_write_scope(key.scope_id)?;
        self.fetch_link(pool, key).await
    }

    pub async fn get_link(&self, pool: &SqlitePool, key: LinkKey) -> Result<Link> {
        self.find_link(pool, key)
            .await?
            .ok_or_else(|| missing_link(key))
    }

    pub async fn list_links(&self, pool: &SqlitePool, filter: &LinkFilter) -> Result<Vec<Link>> {
        self.schema.check_read_scope(filter.scope_id)?;

        let mut conditions = Vec::new();
        let mut binds = Vec::new();
        if let Some(ancestor_id) = filter.ancestor_id {
            binds.push(ancestor_id.0);
            conditions.push(format!("{} = ${}", self.ancestor(), binds.len()));
        }
        if let Some(descendant_id) = filter.descendant_id {
            binds.push(descendant_id.0);
            conditions.push(format!("{} = ${}", self.descendant(), binds.len()));
        }
        if let (Some(scope), Some(scope_id)) = (self.scope(), filter.scope_id) {
            binds.push(scope_id.0);
            conditions.push(format!("{} = ${}", scope, binds.len()));
        }
        match filter.directness {
            Directness::Any => {}
            Directness::Direct => conditions.push(format!("{} = 1", self.direct())),
            Directness::Indirect => conditions.push(format!("{} = 0", self.direct())),
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        let sql = format!(
            "SELECT {} FROM {} {} ORDER BY scope_id ASC, ancestor_id ASC, descendant_id ASC",
            self.select_columns(),
            self.table(),
            where_clause
        );

        let mut query = sqlx::query_as::<Sqlite, LinkRow>(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(pool)
            .await
            .map_err(|err| db_err("Failed to list links", err))?;

        Ok(rows.into_iter().map(Link::from).collect())
    }

    /// Loads every link the planner reads for the edge `ancestor -> descendant`:
    /// links into `ancestor`, links out of `descendant`, and the links between
    /// those two sets.
    async fn load_neighborhood(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        ancestor: NodeId,
        descendant: NodeId,
        scope_id: Option<ScopeId>,
    ) -> Result<ClosureSnapshot> {
        let sql = format!(
            r#"
            SELECT {columns}
            FROM {table}
            WHERE (
                {desc} = $1
                OR {anc} = $2
                OR (
                    ({anc} = $1 OR {anc} IN (
                        SELECT {anc} FROM {table} WHERE {desc} = $1{scope}
                    ))
                    AND ({desc} = $2 OR {desc} IN (
                        SELECT {desc} FROM {table} WHERE {anc} = $2{scope}
                    ))
                )
            ){scope}
            "#,
            columns = self.select_columns(),
            table = self.table(),
            anc = self.ancestor(),
            desc = self.descendant(),
            scope = self.scope_filter(3),
        );

        let mut query = sqlx::query_as::<Sqlite, LinkRow>(&sql)
            .bind(ancestor.0)
            .bind(descendant.0);
        if let (true, Some(scope_id)) = (self.schema.is_scoped(), scope_id) {
            query = query.bind(scope_id.0);
        }
        let rows = query
            .fetch_all(&mut **tx)
            .await
            .map_err(|err| db_err("Failed to load link neighbourhood", err))?;

        Ok(ClosureSnapshot::from_links(
            scope_id,
            rows.into_iter().map(Link::from),
        ))
    }

    async fn apply_mutations(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        mutations: &[LinkMutation],
    ) -> Result<()> {
        let insert_sql = match self.scope() {
            Some(scope) => format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}) VALUES ($1, $2, $3, $4, $5)",
                self.table(),
                self.ancestor(),
                self.descendant(),
                self.direct(),
                self.count(),
                scope
            ),
            None => format!(
                "INSERT INTO {} ({}, {}, {}, {}) VALUES ($1, $2, $3, $4)",
                self.table(),
                self.ancestor(),
                self.descendant(),
                self.direct(),
                self.count()
            ),
        };
        let adjust_sql = format!(
            "UPDATE {table} SET {count} = {count} + $1 WHERE {key}",
            table = self.table(),
            count = self.count(),
            key = self.key_clause(2)
        );
        let set_direct_sql = format!(
            "UPDATE {} SET {} = $1 WHERE {}",
            self.table(),
            self.direct(),
            self.key_clause(2)
        );
        let delete_sql = format!("DELETE FROM {} WHERE {}", self.table(), self.key_clause(1));

        for mutation in mutations {
            let result: std::result::Result<SqliteQueryResult, sqlx::Error> = match mutation {
                LinkMutation::Insert { link } => {
                    let mut query = sqlx::query::<Sqlite>(&insert_sql)
                        .bind(link.ancestor_id.0)
                        .bind(link.descendant_id.0)
                        .bind(link.direct)
                        .bind(link.count);
                    if let (true, Some(scope_id)) = (self.schema.is_scoped(), link.scope_id) {
                        query = query.bind(scope_id.0);
                    }
                    query.execute(&mut **tx).await
                }
                LinkMutation::AdjustCount { key, delta } => {
                    let query = sqlx::query(&adjust_sql).bind(*delta);
                    self.bind_key(query, *key).execute(&mut **tx).await
                }
                LinkMutation::SetDirect { key, direct } => {
                    let query = sqlx::query(&set_direct_sql).bind(*direct);
                    self.bind_key(query, *key).execute(&mut **tx).await
                }
                LinkMutation::Delete { key } => {
                    self.bind_key(sqlx::query(&delete_sql), *key)
                        .execute(&mut **tx)
                        .await
                }
            };

            let result = result.map_err(|err| write_err(mutation, err))?;
            if result.rows_affected() != 1 {
                return Err(LibError::corrupted(
                    "Link table changed while updating the closure",
                    anyhow!(
                        "{:?} affected {} rows on {}",
                        mutation,
                        result.rows_affected(),
                        self.name()
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Inserts a new direct link and every link it implies.
    pub async fn create_link(&self, pool: &SqlitePool, record: &LinkRecord) -> Result<Link> {
        self.schema.check_write_scope(record.scope())?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        let snapshot = self
            .load_neighborhood(&mut tx, record.ancestor(), record.descendant(), record.scope())
            .await?;
        let mutations = closure::plan_create(&snapshot, record)?;
        self.apply_mutations(&mut tx, &mutations).await?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;

        tracing::debug!(
            table = self.name(),
            link = %record.key(),
            mutations = mutations.len(),
            "link created"
        );
        Ok(record.link().clone())
    }

    pub async fn add_direct_link(
        &self,
        pool: &SqlitePool,
        ancestor_id: NodeId,
        descendant_id: NodeId,
        scope_id: Option<ScopeId>,
    ) -> Result<Link> {
        let record = LinkRecord::new_direct(ancestor_id, descendant_id, scope_id);
        self.create_link(pool, &record).await
    }

    async fn write_update(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &LinkRecord,
    ) -> Result<Link> {
        let key = record.key();
        let snapshot = self
            .load_neighborhood(tx, key.ancestor_id, key.descendant_id, key.scope_id)
            .await?;
        let mutations = closure::plan_update(&snapshot, record)?;
        self.apply_mutations(tx, &mutations).await?;

        tracing::debug!(
            table = self.name(),
            link = %key,
            direct = record.direct(),
            mutations = mutations.len(),
            "link updated"
        );
        self.fetch_link(&mut **tx, key)
            .await?
            .ok_or_else(|| missing_link(key))
    }

    /// Writes a pending update built from a previously loaded link. Fails when
    /// the stored row no longer matches the record's persisted version.
    pub async fn update_link(&self, pool: &SqlitePool, record: &LinkRecord) -> Result<Link> {
        self.schema.check_write_scope(record.scope())?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        let link = self.write_update(&mut tx, record).await?;
        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;

        Ok(link)
    }

    /// Loads the link and applies a client patch in the same transaction.
    pub async fn patch_link(
        &self,
        pool: &SqlitePool,
        key: LinkKey,
        patch: &LinkPatch,
    ) -> Result<Link> {
        self.schema.check_write_scope(key.scope_id)?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        let persisted = self
            .fetch_link(&mut *tx, key)
            .await?
            .ok_or_else(|| missing_link(key))?;
        let mut record = LinkRecord::from_persisted(persisted);
        record.apply_patch(patch)?;
        let link = self.write_update(&mut tx, &record).await?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;

        Ok(link)
    }

    /// Promotes an indirect link to direct, or demotes a direct link that has
    /// another path.
    pub async fn set_direct(&self, pool: &SqlitePool, key: LinkKey, direct: bool) -> Result<Link> {
        let patch = LinkPatch {
            direct: Some(direct),
            ..LinkPatch::default()
        };
        self.patch_link(pool, key, &patch).await
    }

    /// Removes a direct link without other paths, and every link only it implied.
    pub async fn destroy_link(&self, pool: &SqlitePool, key: LinkKey) -> Result<()> {
        self.schema.check_write_scope(key.scope_id)?;

        let mut tx = pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;

        let snapshot = self
            .load_neighborhood(&mut tx, key.ancestor_id, key.descendant_id, key.scope_id)
            .await?;
        let link = snapshot
            .find_link(key)
            .cloned()
            .ok_or_else(|| missing_link(key))?;
        let mutations = closure::plan_destroy(&snapshot, &link)?;
        self.apply_mutations(&mut tx, &mutations).await?;

        tx.commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))?;

        tracing::debug!(
            table = self.name(),
            link = %key,
            mutations = mutations.len(),
            "link destroyed"
        );
        Ok(())
    }

    pub async fn remove_direct_link(
        &self,
        pool: &SqlitePool,
        ancestor_id: NodeId,
        descendant_id: NodeId,
        scope_id: Option<ScopeId>,
    ) -> Result<()> {
        self.destroy_link(pool, LinkKey::new(ancestor_id, descendant_id, scope_id))
            .await
    }

    /// Recomputes the closure from the direct links and compares it with the
    /// stored one, scope by scope.
    pub async fn verify_closure(
        &self,
        pool: &SqlitePool,
        scope_id: Option<ScopeId>,
    ) -> Result<ClosureReport> {
        let filter = LinkFilter {
            scope_id,
            ..LinkFilter::default()
        };
        let links = self.list_links(pool, &filter).await?;
        let link_count = links.len();

        let mut by_scope: BTreeMap<Option<ScopeId>, Vec<Link>> = BTreeMap::new();
        for link in links {
            by_scope.entry(link.scope_id).or_default().push(link);
        }
        let violations = by_scope
            .values()
            .flat_map(|links| closure_violations(links))
            .collect::<Vec<_>>();

        if violations.is_empty() {
            tracing::debug!(table = self.name(), links = link_count, "closure verified");
        } else {
            tracing::warn!(
                table = self.name(),
                links = link_count,
                violations = violations.len(),
                "closure is inconsistent"
            );
        }

        Ok(ClosureReport {
            scope_id,
            link_count,
            consistent: violations.is_empty(),
            violations,
        })
    }

    /// Node ids related to `node_id`, ordered by id. Without a scope, a scoped
    /// table is searched across every scope.
    pub(crate) async fn related_nodes(
        &self,
        pool: &SqlitePool,
        node_id: NodeId,
        relation: Relation,
        scope_id: Option<ScopeId>,
    ) -> Result<Vec<NodeId>> {
        self.schema.check_read_scope(scope_id)?;

        let (select, anchor) = if relation.upward() {
            (self.ancestor(), self.descendant())
        } else {
            (self.descendant(), self.ancestor())
        };
        let direct_filter = if relation.direct_only() {
            format!(" AND {} = 1", self.direct())
        } else {
            String::new()
        };
        let scope_filter = if scope_id.is_some() {
            self.scope_filter(2)
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT DISTINCT {select} FROM {table} WHERE {anchor} = $1{direct}{scope} ORDER BY {select} ASC",
            select = select,
            table = self.table(),
            anchor = anchor,
            direct = direct_filter,
            scope = scope_filter,
        );

        let mut query = sqlx::query_scalar::<Sqlite, Uuid>(&sql).bind(node_id.0);
        if let (true, Some(scope_id)) = (self.schema.is_scoped(), scope_id) {
            query = query.bind(scope_id.0);
        }
        let related = query
            .fetch_all(pool)
            .await
            .map_err(|err| db_err("Failed to query related nodes", err))?;

        let mut nodes = Vec::with_capacity(related.len() + 1);
        if relation.includes_self() {
            nodes.push(node_id);
        }
        nodes.extend(related.into_iter().map(NodeId));
        Ok(nodes)
    }

    /// Whether any link leaves (`outgoing`) or enters `node_id`.
    pub(crate) async fn has_links(
        &self,
        pool: &SqlitePool,
        node_id: NodeId,
        outgoing: bool,
        scope_id: Option<ScopeId>,
    ) -> Result<bool> {
        self.schema.check_read_scope(scope_id)?;

        let anchor = if outgoing {
            self.ancestor()
        } else {
            self.descendant()
        };
        let scope_filter = if scope_id.is_some() {
            self.scope_filter(2)
        } else {
            String::new()
        };
        let sql = format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} = $1{} LIMIT 1)",
            self.table(),
            anchor,
            scope_filter
        );

        let mut query = sqlx::query_scalar::<Sqlite, i64>(&sql).bind(node_id.0);
        if let (true, Some(scope_id)) = (self.schema.is_scoped(), scope_id) {
            query = query.bind(scope_id.0);
        }
        let found = query
            .fetch_one(pool)
            .await
            .map_err(|err| db_err("Failed to query node links", err))?;

        Ok(found > 0)
    }
}

fn write_err(mutation: &LinkMutation, err: sqlx::Error) -> LibError {
    let (unique, check) = match err.as_database_error() {
        Some(db) => (db.is_unique_violation(), db.is_check_violation()),
        None => (false, false),
    };

    match mutation {
        LinkMutation::Insert { link } if unique => LibError::violations(
            vec![LinkViolation::Duplicate {
                ancestor_id: link.ancestor_id,
                descendant_id: link.descendant_id,
            }],
            anyhow!(err),
        ),
        _ if check => LibError::corrupted(
            "Link table constraint rejected a closure update",
            anyhow!("{:?} failed: {}", mutation, err),
        ),
        _ => db_err("Failed to update link table", err),
    }
}

fn missing_link(key: LinkKey) -> LibError {
    LibError::not_found("Link not found", anyhow!("link {} not found", key))
}

#[cfg(test)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;
    use crate::error::ErrorKind;

    fn nodes<const N: usize>() -> [NodeId; N] {
        std::array::from_fn(|_| NodeId(Uuid::new_v4()))
    }

    async fn setup(config: LinkTableConfig) -> (SqlitePool, LinkTable) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let table = LinkTable::new(&config).expect("valid config");
        table.create_table(&pool).await.expect("create table");
        (pool, table)
    }

    async fn unscoped() -> (SqlitePool, LinkTable) {
        setup(LinkTableConfig::new("Task")).await
    }

    async fn snapshot(pool: &SqlitePool, table: &LinkTable) -> Vec<Link> {
        table
            .list_links(pool, &LinkFilter::default())
            .await
            .expect("list links")
    }

    async fn assert_consistent(pool: &SqlitePool, table: &LinkTable) {
        let report = table.verify_closure(pool, None).await.expect("verify");
        assert!(report.consistent, "closure drifted: {:?}", report.violations);
    }

    #[tokio::test]
    async fn direct_link_makes_endpoints_related() {
        let (pool, table) = unscoped().await;
        let [a, b] = nodes::<2>();

        let link = table
            .add_direct_link(&pool, a, b, None)
            .await
            .expect("a -> b");
        assert!(link.direct);
        assert_eq!(link.count, 0);

        let stored = table
            .get_link(&pool, LinkKey::new(a, b, None))
            .await
            .expect("stored link");
        assert_eq!(stored, link);

        let descendants = table
            .related_nodes(&pool, a, Relation::Descendants, None)
            .await
            .expect("descendants");
        assert_eq!(descendants, vec![b]);
        let ancestors = table
            .related_nodes(&pool, b, Relation::Ancestors, None)
            .await
            .expect("ancestors");
        assert_eq!(ancestors, vec![a]);
    }

    #[tokio::test]
    async fn reverse_edge_fails_without_partial_writes() {
        let (pool, table) = unscoped().await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");
        let before = snapshot(&pool, &table).await;

        let err = table
            .add_direct_link(&pool, b, a, None)
            .await
            .expect_err("b -> a is a cycle");
        assert_eq!(err.code, "link_long_cycle");

        let err = table
            .add_direct_link(&pool, c, a, None)
            .await
            .expect_err("c -> a is a cycle");
        assert_eq!(err.code, "link_long_cycle");

        assert_eq!(snapshot(&pool, &table).await, before);
    }

    #[tokio::test]
    async fn failed_propagation_rolls_back_earlier_writes() {
        let (pool, table) = unscoped().await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        let before = snapshot(&pool, &table).await;

        // The direct row for b -> c is written first; the derived a -> c row then fails.
        let trigger = format!(
            "CREATE TRIGGER \"{table}_no_derived\" BEFORE INSERT ON \"{table}\" \
             WHEN NEW.direct = 0 BEGIN SELECT RAISE(ABORT, 'derived rows disabled'); END",
            table = table.name()
        );
        sqlx::query::<Sqlite>(&trigger)
            .execute(&pool)
            .await
            .expect("create trigger");

        table
            .add_direct_link(&pool, b, c, None)
            .await
            .expect_err("derived insert is aborted");

        assert_eq!(snapshot(&pool, &table).await, before);
        let missing = table
            .find_link(&pool, LinkKey::new(b, c, None))
            .await
            .expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn duplicate_and_self_edges_fail() {
        let (pool, table) = unscoped().await;
        let [a, b] = nodes::<2>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");

        let err = table
            .add_direct_link(&pool, a, b, None)
            .await
            .expect_err("duplicate");
        assert_eq!(err.code, "link_duplicate");

        let err = table
            .add_direct_link(&pool, a, a, None)
            .await
            .expect_err("self edge");
        assert_eq!(err.code, "link_short_cycle");
        assert!(err.has_violation(&LinkViolation::SelfLoop { node_id: a }));
    }

    #[tokio::test]
    async fn chain_and_diamond_counts() {
        let (pool, table) = unscoped().await;
        let [a, b, c, x] = nodes::<4>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");

        let ac = table
            .get_link(&pool, LinkKey::new(a, c, None))
            .await
            .expect("a -> c");
        assert!(!ac.direct);
        assert_eq!(ac.count, 1);

        table.add_direct_link(&pool, a, x, None).await.expect("a -> x");
        table.add_direct_link(&pool, x, c, None).await.expect("x -> c");
        let ac = table
            .get_link(&pool, LinkKey::new(a, c, None))
            .await
            .expect("a -> c");
        assert_eq!(ac.count, 2);
        assert_consistent(&pool, &table).await;
    }

    #[tokio::test]
    async fn removal_decrements_and_deletes() {
        let (pool, table) = unscoped().await;
        let [a, b, c, x] = nodes::<4>();
        for (ancestor, descendant) in [(a, b), (b, c), (a, x), (x, c)] {
            table
                .add_direct_link(&pool, ancestor, descendant, None)
                .await
                .expect("add edge");
        }

        table
            .remove_direct_link(&pool, b, c, None)
            .await
            .expect("remove b -> c");
        assert!(
            table
                .find_link(&pool, LinkKey::new(b, c, None))
                .await
                .expect("query")
                .is_none()
        );
        let ac = table
            .get_link(&pool, LinkKey::new(a, c, None))
            .await
            .expect("a -> c survives through x");
        assert_eq!(ac.count, 1);

        table
            .remove_direct_link(&pool, x, c, None)
            .await
            .expect("remove x -> c");
        assert!(
            table
                .find_link(&pool, LinkKey::new(a, c, None))
                .await
                .expect("query")
                .is_none()
        );
        assert_consistent(&pool, &table).await;
    }

    #[tokio::test]
    async fn add_then_remove_restores_prior_state() {
        let (pool, table) = unscoped().await;
        let [a, b, c, d] = nodes::<4>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, c, d, None).await.expect("c -> d");
        let before = snapshot(&pool, &table).await;

        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");
        assert_eq!(snapshot(&pool, &table).await.len(), 6);
        table
            .remove_direct_link(&pool, b, c, None)
            .await
            .expect("remove b -> c");

        assert_eq!(snapshot(&pool, &table).await, before);
    }

    #[tokio::test]
    async fn indirect_links_cannot_be_removed() {
        let (pool, table) = unscoped().await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");

        let err = table
            .remove_direct_link(&pool, a, c, None)
            .await
            .expect_err("indirect");
        assert_eq!(err.code, "link_indirect_removal");

        let err = table
            .remove_direct_link(&pool, c, a, None)
            .await
            .expect_err("missing");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn count_is_protected_on_update() {
        let (pool, table) = unscoped().await;
        let [a, b] = nodes::<2>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");

        let err = table
            .patch_link(
                &pool,
                LinkKey::new(a, b, None),
                &LinkPatch {
                    count: Some(3),
                    ..LinkPatch::default()
                },
            )
            .await
            .expect_err("count is protected");
        assert_eq!(err.kind, ErrorKind::ProtectedField);

        let err = table
            .patch_link(
                &pool,
                LinkKey::new(a, b, None),
                &LinkPatch {
                    descendant_id: Some(a),
                    ..LinkPatch::default()
                },
            )
            .await
            .expect_err("endpoints are immutable");
        assert_eq!(err.kind, ErrorKind::ProtectedField);
    }

    #[tokio::test]
    async fn demotion_rules() {
        let (pool, table) = unscoped().await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, c, None).await.expect("a -> c");
        let key = LinkKey::new(a, c, None);

        let err = table
            .set_direct(&pool, key, false)
            .await
            .expect_err("lone direct link");
        assert_eq!(err.code, "link_unsafe_demotion");

        let err = table
            .set_direct(&pool, key, true)
            .await
            .expect_err("already direct");
        assert_eq!(err.code, "link_no_changes");

        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");
        let err = table
            .destroy_link(&pool, key)
            .await
            .expect_err("a -> c has another path");
        assert_eq!(err.code, "link_has_other_paths");

        let demoted = table.set_direct(&pool, key, false).await.expect("demote");
        assert!(!demoted.direct);
        assert_eq!(demoted.count, 1);
        assert_consistent(&pool, &table).await;

        let promoted = table.set_direct(&pool, key, true).await.expect("promote");
        assert!(promoted.direct);
        assert_eq!(promoted.count, 1);
        assert_consistent(&pool, &table).await;
    }

    #[tokio::test]
    async fn stale_update_is_rejected() {
        let (pool, table) = unscoped().await;
        let [a, b, c, x] = nodes::<4>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");
        let loaded = table
            .get_link(&pool, LinkKey::new(a, c, None))
            .await
            .expect("a -> c");

        table.add_direct_link(&pool, a, x, None).await.expect("a -> x");
        table.add_direct_link(&pool, x, c, None).await.expect("x -> c");

        let mut record = LinkRecord::from_persisted(loaded);
        record.set_direct(true);
        let err = table
            .update_link(&pool, &record)
            .await
            .expect_err("stored count moved on");
        assert_eq!(err.public, "Link was changed by another writer");
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let (pool, table) = setup(LinkTableConfig::new("Task").with_scope_column("scope_id")).await;
        let [a, b, c] = nodes::<3>();
        let (s1, s2) = (ScopeId(Uuid::new_v4()), ScopeId(Uuid::new_v4()));

        table.add_direct_link(&pool, a, b, Some(s1)).await.expect("s1 a -> b");
        table.add_direct_link(&pool, b, c, Some(s1)).await.expect("s1 b -> c");
        // The reverse edge is fine in another scope.
        table.add_direct_link(&pool, b, a, Some(s2)).await.expect("s2 b -> a");

        let in_s2 = table
            .related_nodes(&pool, a, Relation::Descendants, Some(s2))
            .await
            .expect("s2 descendants");
        assert!(in_s2.is_empty());
        assert!(table.has_links(&pool, a, false, Some(s2)).await.expect("s2 root"));
        assert!(!table.has_links(&pool, a, false, Some(s1)).await.expect("s1 root"));

        let everywhere = table
            .related_nodes(&pool, b, Relation::SelfAndDescendants, None)
            .await
            .expect("all scopes");
        assert_eq!(everywhere[0], b);
        assert_eq!(everywhere.len(), 3);

        let err = table
            .add_direct_link(&pool, a, c, None)
            .await
            .expect_err("scope is required");
        assert_eq!(err.kind, ErrorKind::InvalidInput);

        let report = table.verify_closure(&pool, None).await.expect("verify");
        assert!(report.consistent);
        assert_eq!(report.link_count, 4);
    }

    #[tokio::test]
    async fn custom_columns_are_honoured() {
        let config = LinkTableConfig {
            ancestor_id_column: "parent".to_string(),
            descendant_id_column: "child".to_string(),
            direct_column: "is_direct".to_string(),
            count_column: "paths".to_string(),
            ..LinkTableConfig::new("Category").with_table("category_links")
        };
        let (pool, table) = setup(config).await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");

        let paths: i64 = sqlx::query_scalar(
            r#"SELECT "paths" FROM "category_links" WHERE "parent" = $1 AND "child" = $2"#,
        )
        .bind(a.0)
        .bind(c.0)
        .fetch_one(&pool)
        .await
        .expect("raw row");
        assert_eq!(paths, 1);
    }

    #[tokio::test]
    async fn listing_filters_by_directness() {
        let (pool, table) = unscoped().await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");

        let indirect = table
            .list_links(
                &pool,
                &LinkFilter {
                    directness: Directness::Indirect,
                    ..LinkFilter::default()
                },
            )
            .await
            .expect("indirect links");
        assert_eq!(indirect.len(), 1);
        assert_eq!(indirect[0].key(), LinkKey::new(a, c, None));

        let from_a = table
            .list_links(
                &pool,
                &LinkFilter {
                    ancestor_id: Some(a),
                    directness: Directness::Direct,
                    ..LinkFilter::default()
                },
            )
            .await
            .expect("direct links from a");
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].descendant_id, b);
    }

    #[tokio::test]
    async fn tampered_rows_are_reported() {
        let (pool, table) = unscoped().await;
        let [a, b, c] = nodes::<3>();
        table.add_direct_link(&pool, a, b, None).await.expect("a -> b");
        table.add_direct_link(&pool, b, c, None).await.expect("b -> c");

        sqlx::query(r#"UPDATE "dag_links" SET "count" = 4 WHERE "direct" = 0"#)
            .execute(&pool)
            .await
            .expect("tamper");

        let report = table.verify_closure(&pool, None).await.expect("verify");
        assert!(!report.consistent);
        assert_eq!(report.violations.len(), 1);

        // Removing b -> c would take the tampered link to 3, not 0.
        table
            .remove_direct_link(&pool, b, c, None)
            .await
            .expect("removal keeps the row alive");
        let ac = table
            .get_link(&pool, LinkKey::new(a, c, None))
            .await
            .expect("a -> c");
        assert_eq!(ac.count, 3);
    }
}
