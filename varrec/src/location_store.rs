//! An offset-indexed, overlap-aware map from storage offsets to the variables occupying them.
//!
//! One store exists per storage space (stack and registers). Every entry is keyed by the offset
//! it was registered at and covers `[key, key + size)`. Overlapping entries are permitted; when
//! more than one variable covers an offset, they are returned in identity order so the
//! first-minted variable wins any tie-break.

use crate::containers::unordered::UnorderedMap;
use crate::value::signed_hex;
use crate::variable::{Variable, VariableIdent};
use std::collections::{BTreeMap, BTreeSet};

/// Substitutions of variables for phi variables
pub type Replacements = UnorderedMap<VariableIdent, Variable>;

#[derive(Clone, Default)]
pub struct LocationStore {
    slots: BTreeMap<i64, BTreeSet<Variable>>,
    /// Largest variable size ever registered; bounds the backwards scan for covering entries.
    max_size: usize,
}

/// Two stores are equal when they hold the same entries; the scan bound is not compared.
impl PartialEq for LocationStore {
    fn eq(&self, other: &Self) -> bool {
        self.slots == other.slots
    }
}
impl Eq for LocationStore {}

impl std::fmt::Debug for LocationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_map()
            .entries(self.slots.iter().map(|(k, v)| (signed_hex(*k), v)))
            .finish()
    }
}

impl LocationStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of registered entries
    pub fn len(&self) -> usize {
        self.slots.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterate over `(key, variable)` entries, in offset order
    pub fn iter(&self) -> impl Iterator<Item = (i64, &Variable)> {
        self.slots
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (*k, v)))
    }

    /// All distinct variables in the store
    pub fn variables(&self) -> BTreeSet<Variable> {
        self.slots.values().flatten().copied().collect()
    }

    /// Register `var` at `offset`, keeping whatever else is there.
    pub fn add_variable(&mut self, offset: i64, var: Variable) {
        self.max_size = self.max_size.max(var.size);
        self.slots.entry(offset).or_default().insert(var);
    }

    /// Register `var` at `offset`, dropping every entry that overlaps its span.
    pub fn set_variable(&mut self, offset: i64, var: Variable) {
        let end = offset.saturating_add(var.size.max(1) as i64);
        let lo = offset.saturating_sub(self.max_size as i64);
        let candidates: Vec<i64> = self.slots.range(lo..end).map(|(&k, _)| k).collect();
        for k in candidates {
            if let Some(vs) = self.slots.get_mut(&k) {
                vs.retain(|v| k.saturating_add(v.size.max(1) as i64) <= offset);
                if vs.is_empty() {
                    self.slots.remove(&k);
                }
            }
        }
        self.add_variable(offset, var);
    }

    /// Entries covering `offset`, as `(key, variable)`, in identity order
    fn covering(&self, offset: i64) -> Vec<(i64, Variable)> {
        let lo = offset.saturating_sub(self.max_size as i64);
        let mut found: Vec<(i64, Variable)> = self
            .slots
            .range(lo..=offset)
            .flat_map(|(&k, vs)| vs.iter().map(move |v| (k, *v)))
            .filter(|(k, v)| v.covers(*k, offset))
            .collect();
        found.sort_by_key(|(_, v)| *v);
        found
    }

    /// All variables covering `offset`, first-minted first
    pub fn get_variables_by_offset(&self, offset: i64) -> Vec<Variable> {
        self.covering(offset).into_iter().map(|(_, v)| v).collect()
    }

    /// Where the first variable covering `offset` begins
    pub fn get_base_addr(&self, offset: i64) -> Option<i64> {
        self.covering(offset).first().map(|(k, _)| *k)
    }

    pub fn contains(&self, offset: i64) -> bool {
        !self.covering(offset).is_empty()
    }

    /// Rename variables according to `replacements`
    pub fn replace(mut self, replacements: &Replacements) -> Self {
        if replacements.is_empty() {
            return self;
        }
        for vs in self.slots.values_mut() {
            *vs = std::mem::take(vs)
                .into_iter()
                .map(|v| replacements.get(&v.ident).copied().unwrap_or(v))
                .collect();
        }
        for vs in self.slots.values() {
            for v in vs {
                self.max_size = self.max_size.max(v.size);
            }
        }
        self
    }

    /// Per-offset union of `self` and `other`, after renaming `other`'s variables according to
    /// `replacements`.
    pub fn merge(mut self, other: &LocationStore, replacements: &Replacements) -> Self {
        for (k, v) in other.iter() {
            let v = replacements.get(&v.ident).copied().unwrap_or(*v);
            self.add_variable(k, v);
        }
        self
    }

    /// Keys present in either store, with the variable sets registered there
    pub(crate) fn zip_slots<'a>(
        &'a self,
        other: &'a LocationStore,
    ) -> impl Iterator<Item = (i64, Option<&'a BTreeSet<Variable>>, Option<&'a BTreeSet<Variable>>)>
    {
        let keys: BTreeSet<i64> = self.slots.keys().chain(other.slots.keys()).copied().collect();
        keys.into_iter()
            .map(move |k| (k, self.slots.get(&k), other.slots.get(&k)))
    }
}
