use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LibError, Result};
use crate::link::LinkRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct NodeId(pub Uuid);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for NodeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct ScopeId(pub Uuid);

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScopeId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::from_str(s).map(Self)
    }
}

impl From<Uuid> for ScopeId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// One row of the closure table.
///
/// `count` is the number of derived paths (chains of two or more direct edges)
/// between the endpoints. The direct edge itself is tracked by `direct` and is
/// never part of `count`.
///
/// A direct link is created with `count == 0`, but it keeps a nonzero `count`
/// while other routes join the same endpoints. `direct` alone does not imply
/// `count == 0`; only a direct link with `count == 0` can be removed outright.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    pub direct: bool,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
}

impl Link {
    pub fn key(&self) -> LinkKey {
        LinkKey {
            ancestor_id: self.ancestor_id,
            descendant_id: self.descendant_id,
            scope_id: self.scope_id,
        }
    }

    /// Number of paths this link summarizes, the direct edge included.
    /// `count` plus the direct edge. Saturates at `i64::MAX`, a total that
    /// writes never store.
    pub fn path_count(&self) -> i64 {
        self.count.saturating_add(i64::from(self.direct))
    }
}

/// Identifies a link by its endpoints and optional scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkKey {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
}

impl LinkKey {
    pub fn new(ancestor_id: NodeId, descendant_id: NodeId, scope_id: Option<ScopeId>) -> Self {
        Self {
            ancestor_id,
            descendant_id,
            scope_id,
        }
    }

    pub fn reversed(self) -> Self {
        Self {
            ancestor_id: self.descendant_id,
            descendant_id: self.ancestor_id,
            scope_id: self.scope_id,
        }
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope_id {
            Some(scope_id) => write!(
                f,
                "{} -> {} (scope {})",
                self.ancestor_id, self.descendant_id, scope_id
            ),
            None => write!(f, "{} -> {}", self.ancestor_id, self.descendant_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkViolation {
    Duplicate {
        ancestor_id: NodeId,
        descendant_id: NodeId,
    },
    OppositeDirection {
        ancestor_id: NodeId,
        descendant_id: NodeId,
    },
    SelfLoop {
        node_id: NodeId,
    },
    DirectWithCount {
        count: i64,
    },
    IndirectWithoutCount {
        count: i64,
    },
    NoChanges,
    ManualCountChange,
    UnsafeDemotion,
    IndirectRemoval,
    HasOtherPaths {
        count: i64,
    },
    CycleDetected {
        node_id: NodeId,
    },
    PathCountOverflow {
        ancestor_id: NodeId,
        descendant_id: NodeId,
    },
}

impl LinkViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            LinkViolation::Duplicate { .. } => "link_duplicate",
            LinkViolation::OppositeDirection { .. } => "link_long_cycle",
            LinkViolation::SelfLoop { .. } => "link_short_cycle",
            LinkViolation::DirectWithCount { .. } => "link_direct_with_count",
            LinkViolation::IndirectWithoutCount { .. } => "link_indirect_without_count",
            LinkViolation::NoChanges => "link_no_changes",
            LinkViolation::ManualCountChange => "link_manual_count_change",
            LinkViolation::UnsafeDemotion => "link_unsafe_demotion",
            LinkViolation::IndirectRemoval => "link_indirect_removal",
            LinkViolation::HasOtherPaths { .. } => "link_has_other_paths",
            LinkViolation::CycleDetected { .. } => "link_cycle",
            LinkViolation::PathCountOverflow { .. } => "link_path_count_overflow",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            LinkViolation::Duplicate { .. } => "Link already exists between these points",
            LinkViolation::OppositeDirection { .. } => {
                "Link already exists in the opposite direction"
            }
            LinkViolation::SelfLoop { .. } => "Link must start and end in different places",
            LinkViolation::DirectWithCount { .. } => {
                "Cannot create a direct link with a nonzero count"
            }
            LinkViolation::IndirectWithoutCount { .. } => {
                "Cannot create an indirect link with a count less than 1"
            }
            LinkViolation::NoChanges => "No changes",
            LinkViolation::ManualCountChange => "Do not manually change the count value",
            LinkViolation::UnsafeDemotion => {
                "Cannot make a direct link without another path indirect"
            }
            LinkViolation::IndirectRemoval => "Cannot remove an indirect link",
            LinkViolation::HasOtherPaths { .. } => {
                "Link has other paths, make it indirect instead"
            }
            LinkViolation::CycleDetected { .. } => "Link would introduce a cycle",
            LinkViolation::PathCountOverflow { .. } => {
                "Link would create more paths than a count can hold"
            }
        }
    }
}

impl fmt::Display for LinkViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.public_message())
    }
}

/// Difference between the stored closure and one recomputed from the direct edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClosureViolation {
    SelfLoop {
        node_id: NodeId,
    },
    OppositeLinks {
        ancestor_id: NodeId,
        descendant_id: NodeId,
    },
    CycleDetected,
    PathCountOverflow {
        ancestor_id: NodeId,
        descendant_id: NodeId,
    },
    MissingLink {
        ancestor_id: NodeId,
        descendant_id: NodeId,
        expected_count: i64,
    },
    UnexpectedLink {
        ancestor_id: NodeId,
        descendant_id: NodeId,
    },
    CountMismatch {
        ancestor_id: NodeId,
        descendant_id: NodeId,
        expected: i64,
        actual: i64,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLinkPayload {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    pub scope_id: Option<ScopeId>,
    pub count: Option<i64>,
}

/// Client-side update of an existing link. Only `direct` may actually change.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPatch {
    pub ancestor_id: Option<NodeId>,
    pub descendant_id: Option<NodeId>,
    pub direct: Option<bool>,
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLinkPayload {
    pub ancestor_id: NodeId,
    pub descendant_id: NodeId,
    pub scope_id: Option<ScopeId>,
    pub direct: Option<bool>,
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Directness {
    #[default]
    Any,
    Direct,
    Indirect,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkFilter {
    pub ancestor_id: Option<NodeId>,
    pub descendant_id: Option<NodeId>,
    pub scope_id: Option<ScopeId>,
    #[serde(default)]
    pub directness: Directness,
}

/// Which nodes to walk to from a given node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    Ancestors,
    Descendants,
    Parents,
    Children,
    SelfAndAncestors,
    SelfAndDescendants,
}

impl Relation {
    pub const ALL: [Relation; 6] = [
        Relation::Ancestors,
        Relation::Descendants,
        Relation::Parents,
        Relation::Children,
        Relation::SelfAndAncestors,
        Relation::SelfAndDescendants,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Relation::Ancestors => "ancestors",
            Relation::Descendants => "descendants",
            Relation::Parents => "parents",
            Relation::Children => "children",
            Relation::SelfAndAncestors => "self_and_ancestors",
            Relation::SelfAndDescendants => "self_and_descendants",
        }
    }

    /// Upward relations follow links from descendant to ancestor.
    pub const fn upward(self) -> bool {
        matches!(
            self,
            Relation::Ancestors | Relation::Parents | Relation::SelfAndAncestors
        )
    }

    pub const fn direct_only(self) -> bool {
        matches!(self, Relation::Parents | Relation::Children)
    }

    pub const fn includes_self(self) -> bool {
        matches!(
            self,
            Relation::SelfAndAncestors | Relation::SelfAndDescendants
        )
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = LibError;

    fn from_str(s: &str) -> Result<Self> {
        Relation::ALL
            .into_iter()
            .find(|relation| relation.as_str() == s)
            .ok_or_else(|| {
                LibError::invalid(
                    "Unknown node relation",
                    anyhow!("relation '{}' is not supported", s),
                )
            })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeQuery {
    pub scope_id: Option<ScopeId>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    pub leaf: bool,
    pub root: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClosureReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<ScopeId>,
    pub link_count: usize,
    pub consistent: bool,
    pub violations: Vec<ClosureViolation>,
}

impl CreateLinkPayload {
    pub fn normalize(self) -> Result<LinkRecord> {
        if let Some(count) = self.count {
            return Err(LibError::protected_field(
                "Count is an internal field and cannot be assigned",
                anyhow!(
                    "attempted to create link {} -> {} with count {}",
                    self.ancestor_id,
                    self.descendant_id,
                    count
                ),
            ));
        }

        Ok(LinkRecord::new_direct(
            self.ancestor_id,
            self.descendant_id,
            self.scope_id,
        ))
    }
}

impl UpdateLinkPayload {
    pub fn key(&self) -> LinkKey {
        LinkKey::new(self.ancestor_id, self.descendant_id, self.scope_id)
    }

    pub fn patch(&self) -> LinkPatch {
        LinkPatch {
            ancestor_id: Some(self.ancestor_id),
            descendant_id: Some(self.descendant_id),
            direct: self.direct,
            count: self.count,
        }
    }
}
