//! In-memory graph algorithms behind sibling and parent resolution.
//!
//! Everything here is pure: callers load the relevant edges (already in
//! precedence order), run the algorithm, and write the result back. Edge
//! order matters; whenever two edges conflict, the earlier one wins and the
//! later one is skipped, exactly as if it had never been asserted.

use crate::ids::TagId;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Directed adjacency list.
#[derive(Debug, Clone, Default)]
pub(crate) struct Adjacency {
    edges: HashMap<TagId, Vec<TagId>>,
}

impl Adjacency {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, from: TagId, to: TagId) {
        let targets = self.edges.entry(from).or_default();
        if !targets.contains(&to) {
            targets.push(to);
        }
    }

    pub(crate) fn targets(&self, from: TagId) -> &[TagId] {
        self.edges.get(&from).map(|targets| targets.as_slice()).unwrap_or(&[])
    }

    /// Is `to` reachable from `from` (in at least zero steps)?
    pub(crate) fn reaches(&self, from: TagId, to: TagId) -> bool {
        if from == to {
            return true;
        }
        let mut visited: HashSet<TagId> = HashSet::from([from]);
        let mut queue: VecDeque<TagId> = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for next in self.targets(current) {
                if *next == to {
                    return true;
                }
                if visited.insert(*next) {
                    queue.push_back(*next);
                }
            }
        }
        false
    }

    /// Every node reachable from `start` in one or more steps. `start` is
    /// never part of the result, even when a cycle leads back to it.
    pub(crate) fn reachable(&self, start: TagId) -> BTreeSet<TagId> {
        let mut visited: HashSet<TagId> = HashSet::from([start]);
        let mut queue: VecDeque<TagId> = VecDeque::from([start]);
        let mut result = BTreeSet::new();
        while let Some(current) = queue.pop_front() {
            for next in self.targets(current) {
                if visited.insert(*next) {
                    queue.push_back(*next);
                    result.insert(*next);
                }
            }
        }
        result
    }
}

/// Would adding `from → to` to `edges` close a cycle?
///
/// Self edges count as cycles.
pub(crate) fn closes_cycle(edges: &Adjacency, from: TagId, to: TagId) -> bool {
    edges.reaches(to, from)
}

/// Resolve ordered sibling edges into a fully collapsed `bad → ideal` map.
///
/// - A bad tag keeps the first good tag it was given; later edges for the
///   same bad tag lose.
/// - An edge that would close a cycle with the edges accepted so far is
///   skipped.
/// - Every entry points straight at its chain's ideal tag (one hop).
pub(crate) fn collapse_siblings(edges: impl IntoIterator<Item = (TagId, TagId)>) -> BTreeMap<TagId, TagId> {
    let mut direct: HashMap<TagId, TagId> = HashMap::new();
    for (bad, good) in edges {
        if bad == good || direct.contains_key(&bad) {
            continue;
        }
        // Each tag has at most one outgoing edge, so this walk is a path
        // and terminates: the accepted edges are acyclic.
        let mut current = good;
        let mut cycle = false;
        loop {
            if current == bad {
                cycle = true;
                break;
            }
            match direct.get(&current) {
                Some(next) => current = *next,
                None => break,
            }
        }
        if cycle {
            tracing::trace!(%bad, %good, "Sibling edge skipped: closes a cycle");
            continue;
        }
        direct.insert(bad, good);
    }

    let mut ideals: BTreeMap<TagId, TagId> = BTreeMap::new();
    for bad in direct.keys() {
        if ideals.contains_key(bad) {
            continue;
        }
        let mut path = vec![*bad];
        let mut current = direct[bad];
        let ideal = loop {
            if let Some(known) = ideals.get(&current) {
                break *known;
            }
            match direct.get(&current) {
                Some(next) => {
                    path.push(current);
                    current = *next;
                },
                None => break current,
            }
        };
        for tag in path {
            ideals.insert(tag, ideal);
        }
    }
    ideals
}

/// Resolve ordered (child, parent) edges over ideal tags into
/// `child → ancestors`.
///
/// Self edges and edges that would close a cycle with the edges accepted so
/// far are skipped, so the result is a transitive, irreflexive closure of a
/// DAG. Tags without ancestors have no entry.
pub(crate) fn parent_closure(edges: impl IntoIterator<Item = (TagId, TagId)>) -> BTreeMap<TagId, BTreeSet<TagId>> {
    let mut accepted = Adjacency::new();
    let mut children: BTreeSet<TagId> = BTreeSet::new();
    for (child, parent) in edges {
        if closes_cycle(&accepted, child, parent) {
            tracing::trace!(%child, %parent, "Parent edge skipped: closes a cycle");
            continue;
        }
        accepted.insert(child, parent);
        children.insert(child);
    }
    children
        .into_iter()
        .map(|child| (child, accepted.reachable(child)))
        .filter(|(_, ancestors)| !ancestors.is_empty())
        .collect()
}

/// Undirected view of a set of edges, for finding everything a change can
/// possibly touch.
#[derive(Debug, Clone, Default)]
pub(crate) struct Neighbourhood {
    links: HashMap<TagId, BTreeSet<TagId>>,
}

impl Neighbourhood {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn link(&mut self, a: TagId, b: TagId) {
        self.links.entry(a).or_default().insert(b);
        self.links.entry(b).or_default().insert(a);
    }

    /// Every tag connected to any of `seeds`, seeds included.
    ///
    /// The worklist only ever holds tags that weren't visited before, so the
    /// walk is bounded by the number of distinct tags.
    pub(crate) fn component(&self, seeds: impl IntoIterator<Item = TagId>) -> BTreeSet<TagId> {
        let mut visited: BTreeSet<TagId> = BTreeSet::new();
        let mut frontier: Vec<TagId> = Vec::new();
        for seed in seeds {
            if visited.insert(seed) {
                frontier.push(seed);
            }
        }
        while let Some(current) = frontier.pop() {
            if let Some(links) = self.links.get(&current) {
                let fresh: Vec<TagId> = links.iter().filter(|tag| !visited.contains(tag)).copied().collect();
                for next in fresh {
                    visited.insert(next);
                    frontier.push(next);
                }
            }
        }
        visited
    }
}
