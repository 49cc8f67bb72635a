//! Flattened dependency registries.
//!
//! Every wrapper keeps a map from producer handle to a non-owning pointer at
//! the producer. The map is closed under transitive dependency at the time it
//! is written, so one level of it is the whole lineage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Weak;

use nd_core::HandleId;

pub(crate) struct Lineage<T> {
    entries: BTreeMap<HandleId, Weak<T>>,
}

impl<T> Default for Lineage<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> Lineage<T> {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, handle: HandleId) -> bool {
        self.entries.contains_key(&handle)
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.entries.keys().copied()
    }

    pub(crate) fn snapshot(&self) -> Vec<(HandleId, Weak<T>)> {
        self.entries
            .iter()
            .map(|(handle, weak)| (*handle, weak.clone()))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Records `producer` and everything it depended on, skipping `owner`
    /// itself. Existing entries win.
    pub(crate) fn absorb(&mut self, owner: HandleId, producer: &ProducerSnapshot<T>) -> usize {
        let before = self.entries.len();
        let direct = std::iter::once((producer.handle, &producer.weak));
        let inherited = producer.lineage.iter().map(|(handle, weak)| (*handle, weak));
        for (handle, weak) in direct.chain(inherited) {
            if handle != owner {
                self.entries.entry(handle).or_insert_with(|| weak.clone());
            }
        }
        self.entries.len() - before
    }

    pub(crate) fn take(&mut self) -> BTreeMap<HandleId, Weak<T>> {
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn replace(&mut self, entries: BTreeMap<HandleId, Weak<T>>) {
        self.entries = entries;
    }
}

/// A producer's identity and lineage, read under its own lock and applied
/// later under the result's.
pub(crate) struct ProducerSnapshot<T> {
    pub(crate) handle: HandleId,
    pub(crate) weak: Weak<T>,
    pub(crate) lineage: Vec<(HandleId, Weak<T>)>,
}

/// Split of a registry into entries to keep and entries to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleasePlan<V> {
    pub kept: BTreeMap<HandleId, V>,
    /// Sorted by handle.
    pub released: Vec<(HandleId, V)>,
}

/// Partitions `entries` by membership in `exclusion` alone, so the result
/// does not depend on the order `entries` arrive in.
pub fn release_plan<V, I>(entries: I, exclusion: &BTreeSet<HandleId>) -> ReleasePlan<V>
where
    I: IntoIterator<Item = (HandleId, V)>,
{
    let (kept, released): (BTreeMap<_, _>, BTreeMap<_, _>) = entries
        .into_iter()
        .partition(|(handle, _)| exclusion.contains(handle));
    ReleasePlan {
        kept,
        released: released.into_iter().collect(),
    }
}

/// Outcome of a transitive release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Disposed by this call.
    pub released: Vec<HandleId>,
    /// Already disposed or dropped; pruned from the registry all the same.
    pub already_gone: Vec<HandleId>,
    pub retained: Vec<HandleId>,
}

impl ReleaseReport {
    #[must_use]
    pub fn pruned(&self) -> usize {
        self.released.len() + self.already_gone.len()
    }
}
