//! Incremental maintenance of the closure table.
//!
//! Adding the direct edge `u -> v` creates `paths(a, u) * paths(v, d)` new
//! paths from every `a` in `{u} + ancestors(u)` to every `d` in
//! `{v} + descendants(v)`, where `paths(x, x) = 1`. Removing the edge takes the
//! same paths away again. None of those paths can use `u -> v` itself, so the
//! products are the same before and after the edge exists.

use std::collections::HashMap;

use anyhow::anyhow;
use serde::Serialize;

use crate::error::{LibError, Result};
use crate::invariants::{self, LinkLookup};
use crate::link::LinkRecord;
use crate::models::{Link, LinkKey, LinkViolation, NodeId, ScopeId};

/// A single row change produced by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LinkMutation {
    Insert { link: Link },
    AdjustCount { key: LinkKey, delta: i64 },
    SetDirect { key: LinkKey, direct: bool },
    Delete { key: LinkKey },
}

impl LinkMutation {
    pub fn key(&self) -> LinkKey {
        match self {
            LinkMutation::Insert { link } => link.key(),
            LinkMutation::AdjustCount { key, .. }
            | LinkMutation::SetDirect { key, .. }
            | LinkMutation::Delete { key } => *key,
        }
    }
}

/// The links of one scope, or the part of them an operation can touch.
///
/// The storage layer loads only the neighbourhood of the edge being changed:
/// links ending at `u`, links starting at `v`, and links between those two
/// sets. That is everything the planner reads.
#[derive(Debug, Clone, Default)]
pub struct ClosureSnapshot {
    scope_id: Option<ScopeId>,
    links: HashMap<(NodeId, NodeId), Link>,
}

impl ClosureSnapshot {
    pub fn new(scope_id: Option<ScopeId>) -> Self {
        Self {
            scope_id,
            links: HashMap::new(),
        }
    }

    /// Links outside `scope_id` are skipped.
    pub fn from_links(scope_id: Option<ScopeId>, links: impl IntoIterator<Item = Link>) -> Self {
        let mut snapshot = Self::new(scope_id);
        for link in links {
            if link.scope_id == scope_id {
                snapshot
                    .links
                    .insert((link.ancestor_id, link.descendant_id), link);
            }
        }
        snapshot
    }

    pub fn scope_id(&self) -> Option<ScopeId> {
        self.scope_id
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn get(&self, ancestor_id: NodeId, descendant_id: NodeId) -> Option<&Link> {
        self.links.get(&(ancestor_id, descendant_id))
    }

    /// All links ordered by ancestor, then descendant.
    pub fn links(&self) -> Vec<Link> {
        let mut links = self.links.values().cloned().collect::<Vec<_>>();
        links.sort_by_key(|link| (link.ancestor_id, link.descendant_id));
        links
    }

    /// `node` itself plus every ancestor, with the number of paths to `node`.
    pub fn upstream(&self, node: NodeId) -> Vec<(NodeId, i64)> {
        let mut upstream = vec![(node, 1)];
        upstream.extend(
            self.links
                .values()
                .filter(|link| link.descendant_id == node)
                .map(|link| (link.ancestor_id, link.path_count())),
        );
        upstream
    }

    /// `node` itself plus every descendant, with the number of paths from `node`.
    pub fn downstream(&self, node: NodeId) -> Vec<(NodeId, i64)> {
        let mut downstream = vec![(node, 1)];
        downstream.extend(
            self.links
                .values()
                .filter(|link| link.ancestor_id == node)
                .map(|link| (link.descendant_id, link.path_count())),
        );
        downstream
    }

    /// Applies a plan all-or-nothing: every mutation is checked before any is applied.
    pub fn apply(&mut self, mutations: &[LinkMutation]) -> Result<()> {
        for mutation in mutations {
            self.check_applicable(mutation)?;
        }

        for mutation in mutations {
            match mutation {
                LinkMutation::Insert { link } => {
                    self.links
                        .insert((link.ancestor_id, link.descendant_id), link.clone());
                }
                LinkMutation::AdjustCount { key, delta } => {
                    if let Some(link) = self.links.get_mut(&(key.ancestor_id, key.descendant_id)) {
                        link.count += delta;
                    }
                }
                LinkMutation::SetDirect { key, direct } => {
                    if let Some(link) = self.links.get_mut(&(key.ancestor_id, key.descendant_id)) {
                        link.direct = *direct;
                    }
                }
                LinkMutation::Delete { key } => {
                    self.links.remove(&(key.ancestor_id, key.descendant_id));
                }
            }
        }

        Ok(())
    }

    fn check_applicable(&self, mutation: &LinkMutation) -> Result<()> {
        let key = mutation.key();
        if key.scope_id != self.scope_id {
            return Err(LibError::corrupted(
                "Link change targets another scope",
                anyhow!("mutation {:?} outside snapshot scope {:?}", mutation, self.scope_id),
            ));
        }

        let existing = self.get(key.ancestor_id, key.descendant_id);
        match (mutation, existing) {
            (LinkMutation::Insert { .. }, Some(_)) => Err(LibError::corrupted(
                "Link already exists in the closure",
                anyhow!("insert of existing link {}", key),
            )),
            (LinkMutation::Insert { .. }, None) => Ok(()),
            (LinkMutation::AdjustCount { delta, .. }, Some(link)) => {
                if adjusted_count(link, *delta)? < 0 {
                    return Err(LibError::corrupted(
                        "Link count would become negative",
                        anyhow!("count {} of {} adjusted by {}", link.count, key, delta),
                    ));
                }
                Ok(())
            }
            (LinkMutation::SetDirect { direct: true, .. }, Some(link))
                if link.count == i64::MAX =>
            {
                Err(path_count_overflow(key))
            }
            (_, Some(_)) => Ok(()),
            (_, None) => Err(LibError::corrupted(
                "Link missing from the closure",
                anyhow!("mutation {:?} targets missing link", mutation),
            )),
        }
    }

    /// Validates, plans and applies a new direct link.
    pub fn add_direct_link(&mut self, ancestor_id: NodeId, descendant_id: NodeId) -> Result<Link> {
        let record = LinkRecord::new_direct(ancestor_id, descendant_id, self.scope_id);
        let mutations = plan_create(self, &record)?;
        self.apply(&mutations)?;
        Ok(record.into_link())
    }

    /// Validates, plans and applies the removal of a direct link.
    pub fn remove_direct_link(&mut self, ancestor_id: NodeId, descendant_id: NodeId) -> Result<()> {
        let link = self
            .get(ancestor_id, descendant_id)
            .cloned()
            .ok_or_else(|| missing_link(LinkKey::new(ancestor_id, descendant_id, self.scope_id)))?;
        let mutations = plan_destroy(self, &link)?;
        self.apply(&mutations)
    }

    /// Validates, plans and applies a pending update.
    pub fn update_link(&mut self, record: &LinkRecord) -> Result<Link> {
        let mutations = plan_update(self, record)?;
        self.apply(&mutations)?;
        self.get(record.ancestor(), record.descendant())
            .cloned()
            .ok_or_else(|| missing_link(record.key()))
    }
}

impl LinkLookup for ClosureSnapshot {
    fn find_link(&self, key: LinkKey) -> Option<&Link> {
        if key.scope_id != self.scope_id {
            return None;
        }
        self.get(key.ancestor_id, key.descendant_id)
    }
}

/// Plan for inserting a new direct link.
pub fn plan_create(snapshot: &ClosureSnapshot, record: &LinkRecord) -> Result<Vec<LinkMutation>> {
    if !record.is_new_record() {
        return Err(LibError::invalid(
            "Link has already been created",
            anyhow!("create requested for persisted link {}", record.key()),
        ));
    }
    invariants::ensure_creatable(record, snapshot)?;

    let mut mutations = vec![LinkMutation::Insert {
        link: record.link().clone(),
    }];
    mutations.extend(spread(snapshot, record.ancestor(), record.descendant())?);
    Ok(mutations)
}

/// Plan for a promote (indirect to direct) or demote (direct to indirect).
pub fn plan_update(snapshot: &ClosureSnapshot, record: &LinkRecord) -> Result<Vec<LinkMutation>> {
    let Some(persisted) = record.persisted() else {
        return Err(LibError::invalid(
            "Link has not been created yet",
            anyhow!("update requested for new link {}", record.key()),
        ));
    };
    let stored = snapshot
        .find_link(record.key())
        .ok_or_else(|| missing_link(record.key()))?;
    if stored != persisted {
        return Err(LibError::invalid(
            "Link was changed by another writer",
            anyhow!("stale record for {}: stored {:?}", record.key(), stored),
        ));
    }
    invariants::ensure_updatable(record)?;

    let key = record.key();
    let mut mutations = Vec::new();
    if record.direct() {
        if stored.count == i64::MAX {
            return Err(path_count_overflow(key));
        }
        mutations.push(LinkMutation::SetDirect { key, direct: true });
        mutations.extend(spread(snapshot, key.ancestor_id, key.descendant_id)?);
    } else {
        mutations.extend(retract(snapshot, key.ancestor_id, key.descendant_id)?);
        mutations.push(LinkMutation::SetDirect { key, direct: false });
    }
    Ok(mutations)
}

/// Plan for removing a direct link. Destroyability is checked before anything is planned.
pub fn plan_destroy(snapshot: &ClosureSnapshot, link: &Link) -> Result<Vec<LinkMutation>> {
    let stored = snapshot
        .find_link(link.key())
        .ok_or_else(|| missing_link(link.key()))?;
    invariants::ensure_destroyable(stored)?;

    let mut mutations = retract(snapshot, link.ancestor_id, link.descendant_id)?;
    mutations.push(LinkMutation::Delete { key: link.key() });
    Ok(mutations)
}

/// Every `(a, d, paths)` that the edge `ancestor -> descendant` contributes,
/// the edge's own pair excluded.
fn paths_through(
    snapshot: &ClosureSnapshot,
    ancestor: NodeId,
    descendant: NodeId,
) -> Result<Vec<(NodeId, NodeId, i64)>> {
    let upstream = snapshot.upstream(ancestor);
    let downstream = snapshot.downstream(descendant);

    let mut through = Vec::with_capacity(upstream.len() * downstream.len());
    for &(a, up_paths) in &upstream {
        for &(d, down_paths) in &downstream {
            if a == ancestor && d == descendant {
                continue;
            }
            if a == d {
                return Err(LibError::violations(
                    vec![LinkViolation::CycleDetected { node_id: a }],
                    anyhow!(
                        "edge {} -> {} closes a cycle through {}",
                        ancestor,
                        descendant,
                        a
                    ),
                ));
            }
            let paths = up_paths
                .checked_mul(down_paths)
                .ok_or_else(|| path_count_overflow(LinkKey::new(a, d, snapshot.scope_id())))?;
            through.push((a, d, paths));
        }
    }
    Ok(through)
}

fn spread(
    snapshot: &ClosureSnapshot,
    ancestor: NodeId,
    descendant: NodeId,
) -> Result<Vec<LinkMutation>> {
    let scope_id = snapshot.scope_id();
    let mut mutations = Vec::new();
    for (a, d, paths) in paths_through(snapshot, ancestor, descendant)? {
        let key = LinkKey::new(a, d, scope_id);
        if let Some(link) = snapshot.find_link(key) {
            adjusted_count(link, paths)?;
            mutations.push(LinkMutation::AdjustCount { key, delta: paths });
        } else {
            let record = LinkRecord::new_indirect(a, d, scope_id, paths);
            invariants::ensure_creatable(&record, snapshot)?;
            mutations.push(LinkMutation::Insert {
                link: record.into_link(),
            });
        }
    }

    tracing::debug!(
        %ancestor,
        %descendant,
        mutations = mutations.len(),
        "planned closure spread"
    );
    Ok(mutations)
}

fn retract(
    snapshot: &ClosureSnapshot,
    ancestor: NodeId,
    descendant: NodeId,
) -> Result<Vec<LinkMutation>> {
    let scope_id = snapshot.scope_id();
    let mut mutations = Vec::new();
    for (a, d, paths) in paths_through(snapshot, ancestor, descendant)? {
        let key = LinkKey::new(a, d, scope_id);
        let link = snapshot.find_link(key).ok_or_else(|| missing_link(key))?;
        let remaining = link.count - paths;
        if remaining < 0 {
            return Err(LibError::corrupted(
                "Link count is lower than its paths",
                anyhow!("link {} has count {} but {} paths to retract", key, link.count, paths),
            ));
        }

        if remaining == 0 && !link.direct {
            mutations.push(LinkMutation::Delete { key });
        } else {
            mutations.push(LinkMutation::AdjustCount { key, delta: -paths });
        }
    }

    tracing::debug!(
        %ancestor,
        %descendant,
        mutations = mutations.len(),
        "planned closure retract"
    );
    Ok(mutations)
}

/// `link.count` moved by `delta`, provided the total with the direct edge still fits.
fn adjusted_count(link: &Link, delta: i64) -> Result<i64> {
    link.count
        .checked_add(delta)
        .filter(|count| count.checked_add(i64::from(link.direct)).is_some())
        .ok_or_else(|| path_count_overflow(link.key()))
}

fn path_count_overflow(key: LinkKey) -> LibError {
    LibError::violations(
        vec![LinkViolation::PathCountOverflow {
            ancestor_id: key.ancestor_id,
            descendant_id: key.descendant_id,
        }],
        anyhow!("path count of {} does not fit in an i64", key),
    )
}

fn missing_link(key: LinkKey) -> LibError {
    LibError::not_found("Link not found", anyhow!("link {} not found", key))
}
