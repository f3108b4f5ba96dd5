use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::link::LinkRecord;
use crate::models::{Link, LinkKey, LinkViolation};

/// Looks up existing links by endpoints and scope.
pub trait LinkLookup {
    fn find_link(&self, key: LinkKey) -> Option<&Link>;
}

impl LinkLookup for [Link] {
    fn find_link(&self, key: LinkKey) -> Option<&Link> {
        self.iter().find(|link| link.key() == key)
    }
}

impl LinkLookup for Vec<Link> {
    fn find_link(&self, key: LinkKey) -> Option<&Link> {
        self.as_slice().find_link(key)
    }
}

/// Every rule a new link breaks, in reporting order.
pub fn create_violations<L>(record: &LinkRecord, lookup: &L) -> Vec<LinkViolation>
where
    L: LinkLookup + ?Sized,
{
    let mut violations = Vec::new();
    let key = record.key();

    if lookup.find_link(key).is_some() {
        violations.push(LinkViolation::Duplicate {
            ancestor_id: key.ancestor_id,
            descendant_id: key.descendant_id,
        });
    }
    if lookup.find_link(key.reversed()).is_some() {
        violations.push(LinkViolation::OppositeDirection {
            ancestor_id: key.ancestor_id,
            descendant_id: key.descendant_id,
        });
    }
    if record.ancestor() == record.descendant() {
        violations.push(LinkViolation::SelfLoop {
            node_id: record.ancestor(),
        });
    }
    if record.direct() && record.count() > 0 {
        violations.push(LinkViolation::DirectWithCount {
            count: record.count(),
        });
    }
    if !record.direct() && record.count() < 1 {
        violations.push(LinkViolation::IndirectWithoutCount {
            count: record.count(),
        });
    }

    violations
}

/// Every rule a pending update to a persisted link breaks.
///
/// `count` never moves when a link is promoted or demoted: the derived paths
/// stay where they are and only the direct edge comes or goes. A demotion is
/// therefore safe only while at least one derived path remains. Counts are
/// written by propagation alone, so any pending count change is rejected.
pub fn update_violations(record: &LinkRecord) -> Vec<LinkViolation> {
    let mut violations = Vec::new();

    if !record.changed() {
        violations.push(LinkViolation::NoChanges);
    }
    if record.count_changed() {
        violations.push(LinkViolation::ManualCountChange);
    }
    if record.direct_changed() && !record.direct() && record.count() < 1 {
        violations.push(LinkViolation::UnsafeDemotion);
    }

    violations
}

/// Only direct links with no other path can be removed outright.
pub fn destroy_violations(link: &Link) -> Vec<LinkViolation> {
    let mut violations = Vec::new();

    if !link.direct {
        violations.push(LinkViolation::IndirectRemoval);
    } else if link.count > 0 {
        violations.push(LinkViolation::HasOtherPaths { count: link.count });
    }

    violations
}

pub fn ensure_creatable<L>(record: &LinkRecord, lookup: &L) -> Result<()>
where
    L: LinkLookup + ?Sized,
{
    let violations = create_violations(record, lookup);
    reject(violations, || format!("create {}", record.key()))
}

pub fn ensure_updatable(record: &LinkRecord) -> Result<()> {
    let violations = update_violations(record);
    reject(violations, || format!("update {}", record.key()))
}

pub fn ensure_destroyable(link: &Link) -> Result<()> {
    let violations = destroy_violations(link);
    reject(violations, || format!("destroy {}", link.key()))
}

fn reject(violations: Vec<LinkViolation>, action: impl FnOnce() -> String) -> Result<()> {
    if violations.is_empty() {
        return Ok(());
    }

    let source = anyhow!("link validation failed for {}: {:?}", action(), violations);
    Err(LibError::violations(violations, source))
}
