//! Join strategy selection for large set intersections.
//!
//! Both mapping tables are indexed in both directions (tag → hash by primary
//! key, hash → tag by secondary index), so any "these files × these tags"
//! question can be answered by driving from either side. The planner only
//! has to pick the side that touches fewer rows. Weights are row estimates:
//! the size of a scratch id set, or the summed tag counts of a tag set.
//!
//! The execution side lives in [`filter`](crate::filter).

/// Which side of a file × tag join drives the index lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinDriver {
    /// Walk the file ids, probing the hash → tag index for each.
    Files,
    /// Walk the tag ids, probing the tag → hash index for each.
    Tags,
}

/// How to drop candidates that already appear in an exclusion set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExclusionStrategy {
    /// One existence test per candidate.
    ProbePerCandidate,
    /// Build the whole exclusion set once, then subtract it.
    Materialize,
}

/// `true` when driving from the file set is cheaper. Ties favour tags.
pub fn prefer_file_driven_join(file_weight: u64, tag_weight: u64) -> bool {
    file_weight < tag_weight
}

pub fn join_driver(file_weight: u64, tag_weight: u64) -> JoinDriver {
    match prefer_file_driven_join(file_weight, tag_weight) {
        true => JoinDriver::Files,
        false => JoinDriver::Tags,
    }
}

/// Probing per candidate wins whenever the candidates are lighter than the
/// exclusion set, i.e. the same comparison as [`prefer_file_driven_join`].
pub fn choose_exclusion_strategy(inner_weight: u64, exclusion_weight: u64) -> ExclusionStrategy {
    match prefer_file_driven_join(inner_weight, exclusion_weight) {
        true => ExclusionStrategy::ProbePerCandidate,
        false => ExclusionStrategy::Materialize,
    }
}
