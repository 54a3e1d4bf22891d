use crate::ids::TagId;

/// A raw sibling (bad → good) or parent (child → parent) assertion.
#[derive(sqlx::FromRow, Debug, Clone, Copy)]
pub(crate) struct EdgeRow {
    pub(crate) from_tag_id: i64,
    pub(crate) to_tag_id: i64,
}

impl EdgeRow {
    pub(crate) fn pair(&self) -> (TagId, TagId) {
        (TagId(self.from_tag_id), TagId(self.to_tag_id))
    }
}

#[derive(sqlx::FromRow, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SiblingRow {
    pub(crate) bad_tag_id: i64,
    pub(crate) ideal_tag_id: i64,
}

impl From<SiblingRow> for (TagId, TagId) {
    fn from(row: SiblingRow) -> Self {
        (TagId(row.bad_tag_id), TagId(row.ideal_tag_id))
    }
}

#[derive(sqlx::FromRow, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ParentRow {
    pub(crate) child_tag_id: i64,
    pub(crate) ancestor_tag_id: i64,
}

impl From<ParentRow> for (TagId, TagId) {
    fn from(row: ParentRow) -> Self {
        (TagId(row.child_tag_id), TagId(row.ancestor_tag_id))
    }
}
