//! Identity handles and small enums shared by every cache table.
//!
//! All ids are opaque `i64` handles: SQLite has no unsigned 64-bit integer,
//! and sqlx refuses to bind `u64`, so there's no point pretending otherwise.

use derive_more::Display;
use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

id_type!(
    /// Identity of a tag (its text lives with [`TagDefinitions`](crate::TagDefinitions)).
    TagId
);
id_type!(
    /// Identity of a file.
    HashId
);
id_type!(
    /// A tag domain. `0` is the virtual domain combining every real tag service.
    TagServiceId
);
id_type!(
    /// A file domain. `0` is the virtual domain combining every file the tag
    /// services know about; its storage rows are the raw mapping assertions.
    FileServiceId
);

impl TagServiceId {
    pub const COMBINED: Self = Self(0);

    pub fn is_combined(&self) -> bool {
        *self == Self::COMBINED
    }
}

impl FileServiceId {
    pub const COMBINED: Self = Self(0);

    pub fn is_combined(&self) -> bool {
        *self == Self::COMBINED
    }
}

/// Which view of a tag relationship (or mapping) is being asked about.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TagDisplayType {
    /// Literal assertions, no sibling or parent resolution.
    #[display("storage")]
    Storage,
    /// A single service's own sibling/parent view.
    #[display("ideal")]
    Ideal,
    /// The fully-resolved multi-service view that display caches are built from.
    #[display("actual")]
    Actual,
}

impl TagDisplayType {
    pub(crate) fn as_db(&self) -> i64 {
        match self {
            Self::Storage => 0,
            Self::Ideal => 1,
            Self::Actual => 2,
        }
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Storage),
            1 => Some(Self::Ideal),
            2 => Some(Self::Actual),
            _ => None,
        }
    }
}

/// Status of a mapping row or a sibling/parent edge.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    #[display("current")]
    Current,
    #[display("deleted")]
    Deleted,
    #[display("pending")]
    Pending,
    #[display("petitioned")]
    Petitioned,
}

impl ContentStatus {
    pub(crate) fn as_db(&self) -> i64 {
        match self {
            Self::Current => 0,
            Self::Deleted => 1,
            Self::Pending => 2,
            Self::Petitioned => 3,
        }
    }

    pub(crate) fn from_db(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Current),
            1 => Some(Self::Deleted),
            2 => Some(Self::Pending),
            3 => Some(Self::Petitioned),
            _ => None,
        }
    }

    /// Whether an edge with this status takes part in sibling/parent resolution.
    pub fn is_applied(&self) -> bool {
        !matches!(self, Self::Deleted)
    }
}

/// Key of one storage or display mapping cache.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("(file service {file_service}, tag service {tag_service})")]
pub struct MappingScope {
    pub file_service: FileServiceId,
    pub tag_service: TagServiceId,
}

impl MappingScope {
    pub fn new(file_service: FileServiceId, tag_service: TagServiceId) -> Self {
        Self { file_service, tag_service }
    }

    pub fn combined(tag_service: TagServiceId) -> Self {
        Self::new(FileServiceId::COMBINED, tag_service)
    }
}
