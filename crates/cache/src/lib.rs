//! SQLite cache engine for tag mappings.
//!
//! This crate maintains the derived state of a tag database: which tags every
//! file displays once sibling and parent relationships are applied, and how
//! many files carry each tag. None of it is the source of truth. Raw sibling
//! and parent edges, raw storage mapping assertions and file-domain membership
//! are; everything else can be regenerated from them.
//!
//! # Architecture
//! - **Resolvers** ([`SiblingResolver`], [`ParentResolver`]) collapse sibling
//!   chains to ideal tags and close parent edges into ancestor tables, per tag
//!   service and per [`TagDisplayType`].
//! - **Mapping caches** ([`StorageMappingsCache`], [`DisplayMappingsCache`])
//!   keep one storage and one display row set per (file domain, tag service)
//!   scope, updated by exact deltas.
//! - **Counts** ([`CountsStore`]) mirror the cardinality of every row set.
//! - **[`TagCache`]** is the single writer sequencing all of the above, one
//!   transaction per operation.

mod counts;
mod db;
mod definitions;
mod display;
mod display_mappings;
mod engine;
pub mod error;
mod filter;
mod graph;
mod ids;
mod ledger;
mod membership;
mod models;
mod parents;
pub mod planner;
mod scratch;
mod search;
mod services;
mod siblings;
mod storage;
mod verify;

pub use crate::counts::{AppliedCounts, CountBounds, CountChanges, CountsStore, TagCounts};
pub use crate::db::Database;
pub use crate::definitions::{MemoryTagDefinitions, TagDefinitions};
pub use crate::display::{DisplayCoordinator, ImplicationDelta};
pub use crate::display_mappings::DisplayMappingsCache;
pub use crate::engine::{CacheSettings, SyncProgress, TagCache};
pub use crate::ids::{ContentStatus, FileServiceId, HashId, MappingScope, TagDisplayType, TagId, TagServiceId};
pub use crate::membership::{FileDomainMembership, MembershipError, MemoryMembership};
pub use crate::parents::ParentResolver;
pub use crate::search::{SearchIndex, TagSuggestion};
pub use crate::services::{Relation, ServiceRegistry};
pub use crate::siblings::SiblingResolver;
pub use crate::storage::{MappingOp, StorageMappingsCache, Transitions};
pub use crate::verify::{Completion, ConsistencyChecker, ConsistencyReport, Mismatch};
