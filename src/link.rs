//! Pending writes against a single link row.
//!
//! A [`LinkRecord`] pairs the persisted version of a link (if any) with the
//! values about to be written, so validators can ask what changed and what
//! the previous value was.

use anyhow::anyhow;

use crate::error::{LibError, Result};
use crate::models::{Link, LinkKey, LinkPatch, NodeId, ScopeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkField {
    AncestorId,
    DescendantId,
    Direct,
    Count,
    ScopeId,
}

impl LinkField {
    pub const ALL: [LinkField; 5] = [
        LinkField::AncestorId,
        LinkField::DescendantId,
        LinkField::Direct,
        LinkField::Count,
        LinkField::ScopeId,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            LinkField::AncestorId => "ancestor_id",
            LinkField::DescendantId => "descendant_id",
            LinkField::Direct => "direct",
            LinkField::Count => "count",
            LinkField::ScopeId => "scope_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    persisted: Option<Link>,
    current: Link,
}

impl LinkRecord {
    /// A new direct link as requested by a client.
    pub fn new_direct(
        ancestor_id: NodeId,
        descendant_id: NodeId,
        scope_id: Option<ScopeId>,
    ) -> Self {
        Self {
            persisted: None,
            current: Link {
                ancestor_id,
                descendant_id,
                direct: true,
                count: 0,
                scope_id,
            },
        }
    }

    pub(crate) fn new_indirect(
        ancestor_id: NodeId,
        descendant_id: NodeId,
        scope_id: Option<ScopeId>,
        count: i64,
    ) -> Self {
        Self {
            persisted: None,
            current: Link {
                ancestor_id,
                descendant_id,
                direct: false,
                count,
                scope_id,
            },
        }
    }

    pub fn from_persisted(link: Link) -> Self {
        Self {
            persisted: Some(link.clone()),
            current: link,
        }
    }

    pub fn ancestor(&self) -> NodeId {
        self.current.ancestor_id
    }

    pub fn descendant(&self) -> NodeId {
        self.current.descendant_id
    }

    pub fn direct(&self) -> bool {
        self.current.direct
    }

    pub fn count(&self) -> i64 {
        self.current.count
    }

    pub fn scope(&self) -> Option<ScopeId> {
        self.current.scope_id
    }

    pub fn key(&self) -> LinkKey {
        self.current.key()
    }

    pub fn link(&self) -> &Link {
        &self.current
    }

    pub fn persisted(&self) -> Option<&Link> {
        self.persisted.as_ref()
    }

    pub fn into_link(self) -> Link {
        self.current
    }

    pub fn is_new_record(&self) -> bool {
        self.persisted.is_none()
    }

    /// New records count every field as changed.
    pub fn field_changed(&self, field: LinkField) -> bool {
        let Some(persisted) = &self.persisted else {
            return true;
        };
        let current = &self.current;
        match field {
            LinkField::AncestorId => persisted.ancestor_id != current.ancestor_id,
            LinkField::DescendantId => persisted.descendant_id != current.descendant_id,
            LinkField::Direct => persisted.direct != current.direct,
            LinkField::Count => persisted.count != current.count,
            LinkField::ScopeId => persisted.scope_id != current.scope_id,
        }
    }

    pub fn changed_fields(&self) -> Vec<LinkField> {
        LinkField::ALL
            .into_iter()
            .filter(|field| self.field_changed(*field))
            .collect()
    }

    pub fn changed(&self) -> bool {
        LinkField::ALL
            .into_iter()
            .any(|field| self.field_changed(field))
    }

    pub fn direct_changed(&self) -> bool {
        self.field_changed(LinkField::Direct)
    }

    pub fn direct_was(&self) -> Option<bool> {
        self.persisted.as_ref().map(|link| link.direct)
    }

    pub fn count_changed(&self) -> bool {
        self.field_changed(LinkField::Count)
    }

    pub fn count_was(&self) -> Option<i64> {
        self.persisted.as_ref().map(|link| link.count)
    }

    pub fn set_direct(&mut self, direct: bool) {
        self.current.direct = direct;
    }

    /// `count` is derived by the propagation engine and can never be assigned.
    pub fn set_count(&mut self, count: i64) -> Result<()> {
        Err(LibError::protected_field(
            "Count is an internal field and cannot be assigned",
            anyhow!(
                "attempted to assign count {} to link {}",
                count,
                self.current.key()
            ),
        ))
    }

    /// Applies a client update. Endpoints are immutable and `count` is internal,
    /// so only `direct` can actually move.
    pub fn apply_patch(&mut self, patch: &LinkPatch) -> Result<()> {
        if let Some(ancestor_id) = patch.ancestor_id
            && ancestor_id != self.current.ancestor_id
        {
            return Err(immutable_column(LinkField::AncestorId, &self.current));
        }
        if let Some(descendant_id) = patch.descendant_id
            && descendant_id != self.current.descendant_id
        {
            return Err(immutable_column(LinkField::DescendantId, &self.current));
        }
        if let Some(count) = patch.count {
            self.set_count(count)?;
        }
        if let Some(direct) = patch.direct {
            self.set_direct(direct);
        }
        Ok(())
    }

    pub(crate) fn adjust_count(&mut self, delta: i64) {
        self.current.count += delta;
    }
}

fn immutable_column(field: LinkField, link: &Link) -> LibError {
    LibError::protected_field(
        "Link endpoints cannot be changed for an existing record",
        anyhow!(
            "column {} is immutable on existing link {}",
            field.as_str(),
            link.key()
        ),
    )
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::error::ErrorKind;

    fn persisted_link(direct: bool, count: i64) -> Link {
        Link {
            ancestor_id: NodeId(Uuid::new_v4()),
            descendant_id: NodeId(Uuid::new_v4()),
            direct,
            count,
            scope_id: None,
        }
    }

    #[test]
    fn persisted_record_starts_unchanged() {
        let record = LinkRecord::from_persisted(persisted_link(true, 0));
        assert!(!record.is_new_record());
        assert!(!record.changed());
        assert!(record.changed_fields().is_empty());
    }

    #[test]
    fn new_record_reports_every_field_changed() {
        let record = LinkRecord::new_direct(NodeId(Uuid::new_v4()), NodeId(Uuid::new_v4()), None);
        assert!(record.changed());
        assert_eq!(record.changed_fields().len(), LinkField::ALL.len());
        assert_eq!(record.direct_was(), None);
        assert_eq!(record.count_was(), None);
    }

    #[test]
    fn direct_change_is_tracked_with_previous_value() {
        let mut record = LinkRecord::from_persisted(persisted_link(false, 2));
        record.set_direct(true);
        assert!(record.direct_changed());
        assert_eq!(record.direct_was(), Some(false));
        assert!(!record.count_changed());
        assert_eq!(record.changed_fields(), vec![LinkField::Direct]);
    }

    #[test]
    fn reverting_a_change_clears_it() {
        let mut record = LinkRecord::from_persisted(persisted_link(true, 0));
        record.set_direct(false);
        record.set_direct(true);
        assert!(!record.changed());
    }

    #[test]
    fn set_count_is_a_protected_field_violation() {
        let mut record = LinkRecord::from_persisted(persisted_link(false, 1));
        let err = record.set_count(5).expect_err("count is protected");
        assert_eq!(err.kind, ErrorKind::ProtectedField);
        assert_eq!(record.count(), 1);
        assert!(!record.count_changed());
    }

    #[test]
    fn engine_count_adjustment_is_tracked() {
        let mut record = LinkRecord::from_persisted(persisted_link(false, 1));
        record.adjust_count(2);
        assert!(record.count_changed());
        assert_eq!(record.count_was(), Some(1));
        assert_eq!(record.count(), 3);
    }

    #[test]
    fn patch_rejects_endpoint_changes() {
        let mut record = LinkRecord::from_persisted(persisted_link(true, 0));
        let err = record
            .apply_patch(&LinkPatch {
                ancestor_id: Some(NodeId(Uuid::new_v4())),
                ..LinkPatch::default()
            })
            .expect_err("ancestor is immutable");
        assert_eq!(err.kind, ErrorKind::ProtectedField);

        let err = record
            .apply_patch(&LinkPatch {
                descendant_id: Some(NodeId(Uuid::new_v4())),
                direct: Some(false),
                ..LinkPatch::default()
            })
            .expect_err("descendant is immutable");
        assert_eq!(err.kind, ErrorKind::ProtectedField);
        assert!(record.direct());
    }

    #[test]
    fn patch_rejects_count_and_accepts_direct() {
        let link = persisted_link(true, 1);
        let mut record = LinkRecord::from_persisted(link.clone());
        let err = record
            .apply_patch(&LinkPatch {
                count: Some(0),
                ..LinkPatch::default()
            })
            .expect_err("count is protected on update");
        assert_eq!(err.kind, ErrorKind::ProtectedField);

        record
            .apply_patch(&LinkPatch {
                ancestor_id: Some(link.ancestor_id),
                descendant_id: Some(link.descendant_id),
                direct: Some(false),
                count: None,
            })
            .expect("direct flag may change");
        assert!(record.direct_changed());
        assert!(!record.direct());
    }
}
