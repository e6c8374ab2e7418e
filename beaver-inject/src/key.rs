//! Binding keys.
//!
//! A [`Key`] names an injectable slot: a type plus an optional [`Qualifier`].
//! Two keys are equal only when both parts are equal, so `String` and
//! `@Named("db") String` are unrelated slots.

use std::{
    any::{TypeId, type_name},
    fmt,
    sync::Arc,
};

use crate::error::{InjectError, Result};

/// Disambiguates two bindings of the same type.
///
/// A marker qualifier is identified by a (usually zero-sized) marker type, the
/// way an annotation type qualifies a binding. A named qualifier carries a
/// free-form name that must be non-blank and free of control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Marker { id: TypeId, name: &'static str },
    Named(Arc<str>),
}

impl Qualifier {
    pub fn marker<M: ?Sized + 'static>() -> Self {
        Qualifier::Marker {
            id: TypeId::of::<M>(),
            name: type_name::<M>(),
        }
    }

    pub fn named(name: &str) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(InjectError::InvalidQualifier {
                qualifier: name.to_string(),
                reason: "name must not be blank".to_string(),
            });
        }
        if let Some(c) = name.chars().find(|c| c.is_control()) {
            return Err(InjectError::InvalidQualifier {
                qualifier: name.escape_debug().to_string(),
                reason: format!("name contains control character {:?}", c),
            });
        }
        Ok(Qualifier::Named(Arc::from(name)))
    }
}

impl fmt::Display for Qualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Qualifier::Marker { name, .. } => write!(f, "@{}", short_name(name)),
            Qualifier::Named(name) => write!(f, "@Named({:?})", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TypeKey {
    Type { id: TypeId, name: &'static str },
    Set(Arc<TypeKey>),
    Map(Arc<TypeKey>),
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKey::Type { name, .. } => f.write_str(&short_name(name)),
            TypeKey::Set(element) => write!(f, "Set<{}>", element),
            TypeKey::Map(value) => write!(f, "Map<String, {}>", value),
        }
    }
}

/// Identity of a binding in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    ty: TypeKey,
    qualifier: Option<Qualifier>,
}

impl Key {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            ty: TypeKey::Type {
                id: TypeId::of::<T>(),
                name: type_name::<T>(),
            },
            qualifier: None,
        }
    }

    /// Key of the set multibinding collecting `element` contributions.
    pub fn set_of(element: &Key) -> Self {
        Self {
            ty: TypeKey::Set(Arc::new(element.ty.clone())),
            qualifier: element.qualifier.clone(),
        }
    }

    /// Key of the map multibinding collecting `value` contributions.
    pub fn map_of(value: &Key) -> Self {
        Self {
            ty: TypeKey::Map(Arc::new(value.ty.clone())),
            qualifier: value.qualifier.clone(),
        }
    }

    pub fn qualified(mut self, qualifier: Qualifier) -> Self {
        self.qualifier = Some(qualifier);
        self
    }

    pub fn named(self, name: &str) -> Result<Self> {
        Ok(self.qualified(Qualifier::named(name)?))
    }

    pub fn qualifier(&self) -> Option<&Qualifier> {
        self.qualifier.as_ref()
    }

    pub fn is_collection(&self) -> bool {
        !matches!(self.ty, TypeKey::Type { .. })
    }

    /// Whether this key's type is exactly `T`, ignoring the qualifier.
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        matches!(self.ty, TypeKey::Type { id, .. } if id == TypeId::of::<T>())
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{} {}", qualifier, self.ty),
            None => write!(f, "{}", self.ty),
        }
    }
}

// Drops the module path of the outer type: `alloc::string::String` renders as
// `String`. Generic arguments keep their paths.
fn short_name(name: &str) -> String {
    let (prefix, path) = match name.strip_prefix("dyn ") {
        Some(rest) => ("dyn ", rest),
        None => ("", name),
    };
    let end = path.find('<').unwrap_or(path.len());
    let start = path[..end].rfind("::").map_or(0, |idx| idx + 2);
    format!("{}{}", prefix, &path[start..])
}
