//! Groups produced by the clustering stage, stored in an id-keyed arena.
//!
//! A group owns the peptides no other group explains and the accessions
//! whose evidence is exactly "own peptides + everything below". Children are
//! groups whose peptides this group also explains, so the full evidence of a
//! group is its own peptides plus the peptides of all of its descendants.

use crate::registry::{AccessionId, PeptideId};
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct GroupId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    /// Connected component this group belongs to
    #[serde(default)]
    pub tree_id: u64,
    #[serde(default)]
    pub peptides: Vec<PeptideId>,
    #[serde(default)]
    pub accessions: Vec<AccessionId>,
    #[serde(default)]
    pub children: Vec<GroupId>,
    #[serde(default)]
    pub parents: Vec<GroupId>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupGraph {
    groups: FnvHashMap<GroupId, Group>,
}

impl GroupGraph {
    pub fn new<I: IntoIterator<Item = Group>>(groups: I) -> Self {
        let mut graph = Self::default();
        groups.into_iter().for_each(|g| graph.insert(g));
        graph
    }

    pub fn insert(&mut self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group ids in ascending order
    pub fn ids(&self) -> Vec<GroupId> {
        let mut ids = self.groups.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> + '_ {
        self.groups.values()
    }

    /// Every group reachable through `children`, excluding `id` itself,
    /// in ascending id order. Diamonds are visited once; unknown ids are
    /// skipped.
    pub fn all_peptide_children(&self, id: GroupId) -> Vec<GroupId> {
        let mut seen = FnvHashSet::default();
        let mut stack = self
            .get(id)
            .map(|g| g.children.clone())
            .unwrap_or_default();
        while let Some(child) = stack.pop() {
            if child == id || seen.contains(&child) {
                continue;
            }
            if let Some(group) = self.get(child) {
                seen.insert(child);
                stack.extend(group.children.iter().copied());
            }
        }
        let mut children = seen.into_iter().collect::<Vec<_>>();
        children.sort_unstable();
        children
    }

    /// Own peptides plus those of every descendant, deduplicated
    pub fn all_peptides(&self, id: GroupId) -> Vec<PeptideId> {
        let mut peptides = self
            .get(id)
            .map(|g| g.peptides.clone())
            .unwrap_or_default();
        for child in self.all_peptide_children(id) {
            if let Some(group) = self.get(child) {
                peptides.extend(group.peptides.iter().copied());
            }
        }
        peptides.sort_unstable();
        peptides.dedup();
        peptides
    }
}
