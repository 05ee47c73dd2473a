//! The bipartite graph between mass traces and the feature groups that use them
use std::collections::{hash_map::Entry, BTreeSet, HashMap, VecDeque};

use identity_hash::{BuildIdentityHasher, IdentityHashable};
use tracing::debug;

use crate::group::FeatureGroup;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TraceKey(pub usize);

impl IdentityHashable for TraceKey {}

impl std::hash::Hash for TraceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.0 as u64)
    }
}

impl From<usize> for TraceKey {
    fn from(value: usize) -> Self {
        TraceKey(value)
    }
}

/// A connected component of the trace sharing graph
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupCluster {
    /// Feature group indices, ascending
    pub groups: Vec<usize>,
    /// Trace indices, ascending
    pub traces: Vec<usize>,
}

impl GroupCluster {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Maps each trace to the feature groups that use it, and each group to its traces.
///
/// Groups are hyperedges over traces. Two groups belong to the same [`GroupCluster`] when a
/// chain of shared traces connects them.
#[derive(Debug, Clone, Default)]
pub struct TraceSharingIndex {
    links: HashMap<TraceKey, Vec<usize>, BuildIdentityHasher<TraceKey>>,
    group_traces: Vec<Vec<usize>>,
}

impl TraceSharingIndex {
    pub fn new(groups: &[FeatureGroup]) -> Self {
        let mut links: HashMap<TraceKey, Vec<usize>, BuildIdentityHasher<TraceKey>> =
            HashMap::default();
        let mut group_traces = Vec::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            for t in group.trace_indices().iter().copied() {
                links.entry(TraceKey(t)).or_default().push(i);
            }
            group_traces.push(group.trace_indices().to_vec());
        }
        Self {
            links,
            group_traces,
        }
    }

    /// The groups that use `trace_index`
    pub fn links(&self, trace_index: usize) -> &[usize] {
        self.links
            .get(&TraceKey(trace_index))
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    pub fn link_count(&self, trace_index: usize) -> usize {
        self.links(trace_index).len()
    }

    /// Whether more than one group uses `trace_index`
    pub fn is_shared(&self, trace_index: usize) -> bool {
        self.link_count(trace_index) > 1
    }

    pub fn set_links(&mut self, trace_index: usize, groups: Vec<usize>) {
        match self.links.entry(TraceKey(trace_index)) {
            Entry::Occupied(mut e) => {
                *e.get_mut() = groups;
            }
            Entry::Vacant(e) => {
                e.insert(groups);
            }
        }
    }

    /// Detach `group` from `trace_index`
    pub fn remove_link(&mut self, trace_index: usize, group: usize) {
        if let Some(groups) = self.links.get_mut(&TraceKey(trace_index)) {
            groups.retain(|g| *g != group);
        }
    }

    pub fn group_traces(&self, group: usize) -> &[usize] {
        self.group_traces
            .get(group)
            .map(|v| v.as_slice())
            .unwrap_or_default()
    }

    pub fn num_groups(&self) -> usize {
        self.group_traces.len()
    }

    /// Partition the groups into clusters that share no trace with one another
    pub fn clusters(&self) -> Vec<GroupCluster> {
        let clusters: Vec<GroupCluster> = BreadthFirstTraversal::new(self).collect();
        debug!(
            "{} clusters from {} feature groups",
            clusters.len(),
            self.num_groups()
        );
        clusters
    }
}

struct BreadthFirstTraversal<'a> {
    index: &'a TraceSharingIndex,
    /// The traces that have not yet been visited, ordered so the traversal is deterministic
    traces: BTreeSet<usize>,
    /// A record of the groups that have been visited already
    group_mask: Vec<bool>,
}

impl Iterator for BreadthFirstTraversal<'_> {
    type Item = GroupCluster;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_component()
    }
}

impl<'a> BreadthFirstTraversal<'a> {
    fn new(index: &'a TraceSharingIndex) -> Self {
        let traces = index
            .links
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| k.0)
            .collect();
        Self {
            index,
            traces,
            group_mask: vec![false; index.num_groups()],
        }
    }

    fn edges_from(&mut self, trace: usize, component: &mut GroupCluster) -> Vec<usize> {
        let mut next = Vec::new();
        for g in self.index.links(trace).iter().copied() {
            if self.group_mask[g] {
                continue;
            }
            self.group_mask[g] = true;
            component.groups.push(g);
            next.extend(
                self.index
                    .group_traces(g)
                    .iter()
                    .copied()
                    .filter(|t| self.traces.contains(t)),
            );
        }
        next
    }

    fn visit(&mut self, trace: usize) -> GroupCluster {
        let mut component = GroupCluster::default();
        let mut queue = VecDeque::from(vec![trace]);
        while let Some(trace) = queue.pop_front() {
            if !self.traces.remove(&trace) {
                continue;
            }
            component.traces.push(trace);
            let next = self.edges_from(trace, &mut component);
            queue.extend(next);
        }
        component.groups.sort_unstable();
        component.traces.sort_unstable();
        component
    }

    fn next_component(&mut self) -> Option<GroupCluster> {
        self.traces.first().copied().map(|t| self.visit(t))
    }
}
