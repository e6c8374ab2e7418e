//! Set and map multibindings.
//!
//! Contributions tagged `into_set` / `into_map` never bind their element key.
//! They are grouped per collection key into a [`MultibindingSet`], which the
//! graph builder turns into one synthesized node producing a [`Multibound`].

use std::{any::Any, collections::HashMap, fmt, sync::Arc};

use crate::{
    descriptor::{Descriptor, Multibinding},
    error::{InjectError, Result},
    injector::Instance,
    key::Key,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Set,
    Map,
}

/// The value of a multibinding: every contribution's value, in registration
/// order.
///
/// Entries are independent draws, so equal values are all kept. Use
/// [`Multibound::distinct`] for set semantics.
#[derive(Clone)]
pub struct Multibound {
    kind: CollectionKind,
    entries: Vec<(Option<Arc<str>>, Instance)>,
}

impl Multibound {
    pub(crate) fn new(kind: CollectionKind, entries: Vec<(Option<Arc<str>>, Instance)>) -> Self {
        Self { kind, entries }
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.entries.iter().map(|(_, value)| value)
    }

    /// Map entries as `(map key, value)`; empty for a set.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Instance)> {
        self.entries
            .iter()
            .filter_map(|(key, value)| key.as_deref().map(|key| (key, value)))
    }

    pub fn get(&self, map_key: &str) -> Option<&Instance> {
        self.entries
            .iter()
            .find(|(key, _)| key.as_deref() == Some(map_key))
            .map(|(_, value)| value)
    }

    /// Every value as a `T`, or `None` if any value is of another type.
    pub fn values<T: Any>(&self) -> Option<Vec<&T>> {
        self.iter().map(Instance::downcast_ref::<T>).collect()
    }

    /// Like [`Multibound::values`], keeping only the first of equal values.
    pub fn distinct<T: Any + PartialEq>(&self) -> Option<Vec<&T>> {
        let values = self.values::<T>()?;
        let mut distinct: Vec<&T> = Vec::with_capacity(values.len());
        for value in values {
            if !distinct.contains(&value) {
                distinct.push(value);
            }
        }
        Some(distinct)
    }
}

impl fmt::Debug for Multibound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multibound")
            .field("kind", &self.kind)
            .field("len", &self.entries.len())
            .finish()
    }
}

/// The contributions to one collection key, in registration order.
pub(crate) struct MultibindingSet<'d> {
    key: Key,
    kind: CollectionKind,
    contributions: Vec<&'d Descriptor>,
}

impl<'d> MultibindingSet<'d> {
    pub(crate) fn new(key: Key, kind: CollectionKind) -> Self {
        Self {
            key,
            kind,
            contributions: Vec::new(),
        }
    }

    pub(crate) fn key(&self) -> &Key {
        &self.key
    }

    pub(crate) fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub(crate) fn contributions(&self) -> &[&'d Descriptor] {
        &self.contributions
    }

    pub(crate) fn push(&mut self, descriptor: &'d Descriptor) {
        self.contributions.push(descriptor);
    }

    /// Map keys must be unique within one map multibinding.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.kind != CollectionKind::Map {
            return Ok(());
        }
        let mut seen: HashMap<&str, &Descriptor> = HashMap::new();
        for &descriptor in &self.contributions {
            let Multibinding::IntoMap(map_key) = descriptor.multibinding() else {
                continue;
            };
            if let Some(first) = seen.insert(&**map_key, descriptor) {
                return Err(InjectError::DuplicateBinding {
                    key: self.key.clone(),
                    first: first.declaration().clone(),
                    second: descriptor.declaration().clone(),
                });
            }
        }
        Ok(())
    }
}

pub(crate) fn map_key(descriptor: &Descriptor) -> Option<Arc<str>> {
    match descriptor.multibinding() {
        Multibinding::IntoMap(map_key) => Some(map_key.clone()),
        _ => None,
    }
}
