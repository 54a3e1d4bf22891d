use crate::error::{Error, ErrorKind};
use crate::ids::TagId;
use exn::ResultExt;

#[derive(sqlx::FromRow, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CountRow {
    pub(crate) tag_id: i64,
    pub(crate) current_count: i64,
    pub(crate) pending_count: i64,
}

/// Counts are stored signed (SQLite has nothing else) but can never be negative.
impl TryFrom<CountRow> for (TagId, u64, u64) {
    type Error = Error;
    fn try_from(row: CountRow) -> Result<Self, Self::Error> {
        Ok((
            TagId(row.tag_id),
            u64::try_from(row.current_count).or_raise(|| ErrorKind::InvalidData("current count"))?,
            u64::try_from(row.pending_count).or_raise(|| ErrorKind::InvalidData("pending count"))?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_counts_are_invalid() {
        let row = CountRow { tag_id: 1, current_count: -1, pending_count: 0 };
        let err = <(TagId, u64, u64)>::try_from(row).unwrap_err();
        assert_eq!(*err, ErrorKind::InvalidData("current count"));
    }
}
