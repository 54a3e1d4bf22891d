use crate::error::{Error, ErrorKind};
use crate::ids::{ContentStatus, HashId, TagId};
use exn::OptionExt;

#[derive(sqlx::FromRow, Debug, Clone, Copy)]
pub(crate) struct MappingRow {
    pub(crate) tag_id: i64,
    pub(crate) hash_id: i64,
    pub(crate) status: i64,
}

impl TryFrom<MappingRow> for (TagId, HashId, ContentStatus) {
    type Error = Error;
    fn try_from(row: MappingRow) -> Result<Self, Self::Error> {
        let status = ContentStatus::from_db(row.status).ok_or_raise(|| ErrorKind::InvalidData("mapping status"))?;
        Ok((TagId(row.tag_id), HashId(row.hash_id), status))
    }
}
