mod counts;
mod edges;
mod mapping;

pub(crate) use self::counts::CountRow;
pub(crate) use self::edges::{EdgeRow, ParentRow, SiblingRow};
pub(crate) use self::mapping::MappingRow;
