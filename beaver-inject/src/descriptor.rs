//! Normalized provider and binding declarations.
//!
//! Modules never hand the graph builder closures directly. Every declaration
//! made through a [`Binder`](crate::module::Binder) is normalized into a
//! [`Descriptor`] and collected, in registration order, into a
//! [`DescriptorSet`].

use std::{any::TypeId, collections::HashSet, fmt, sync::Arc};

use crate::{
    error::Result,
    injector::{Dependencies, Instance},
    key::Key,
    module::{ModuleHandle, ModuleSource},
};

pub(crate) type Factory = Arc<dyn Fn(&Dependencies) -> anyhow::Result<Instance> + Send + Sync>;

/// Identity of a module type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId {
    type_id: TypeId,
    name: &'static str,
}

impl ModuleId {
    pub fn of<M: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<M: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<M>()
    }
}

/// Identity of one module instance inside a [`DescriptorSet`].
///
/// Declarations sharing an owner share that instance's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleInstanceId(pub(crate) usize);

/// Where a binding was declared: module type, method name and the parameter
/// keys of the declaring method, plus the key the method declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Declaration {
    module: ModuleId,
    method: &'static str,
    parameters: Vec<Key>,
    key: Key,
}

impl Declaration {
    pub(crate) fn new(module: ModuleId, method: &'static str, parameters: Vec<Key>, key: Key) -> Self {
        Self {
            module,
            method,
            parameters,
            key,
        }
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn parameters(&self) -> &[Key] {
        &self.parameters
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Whether this declaration is `M::method(parameters..)`.
    pub fn is_method<M: 'static>(&self, method: &str, parameters: &[Key]) -> bool {
        self.module.is::<M>() && self.method == method && self.parameters == parameters
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parameters = self
            .parameters
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<String>>()
            .join(", ");
        write!(
            f,
            "{}::{}({}) -> {}",
            self.module.name, self.method, parameters, self.key
        )
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Evaluated on every request.
    #[default]
    Unscoped,
    /// Evaluated at most once per injector.
    Singleton,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub enum Multibinding {
    #[default]
    Plain,
    IntoSet,
    IntoMap(Arc<str>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    key: Key,
    lazy: bool,
}

impl Dependency {
    pub(crate) fn new(key: Key, lazy: bool) -> Self {
        Self { key, lazy }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// A lazy dependency is handed to the factory unresolved.
    pub fn is_lazy(&self) -> bool {
        self.lazy
    }
}

pub struct ProviderDescriptor {
    pub(crate) key: Key,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) factory: Factory,
    pub(crate) scope: Scope,
    pub(crate) multibinding: Multibinding,
    pub(crate) declaration: Declaration,
    pub(crate) owner: ModuleInstanceId,
}

pub struct BindingDescriptor {
    pub(crate) target: Key,
    pub(crate) source: Key,
    pub(crate) scope: Scope,
    pub(crate) multibinding: Multibinding,
    pub(crate) declaration: Declaration,
    pub(crate) owner: ModuleInstanceId,
}

pub enum Descriptor {
    Provider(ProviderDescriptor),
    Binding(BindingDescriptor),
}

impl Descriptor {
    /// The key this declaration exposes: its own key for a plain
    /// declaration, the element key for a multibinding contribution.
    pub fn key(&self) -> &Key {
        match self {
            Descriptor::Provider(p) => &p.key,
            Descriptor::Binding(b) => &b.target,
        }
    }

    /// The collection key a contribution registers into.
    pub fn collection_key(&self) -> Option<Key> {
        match self.multibinding() {
            Multibinding::Plain => None,
            Multibinding::IntoSet => Some(Key::set_of(self.key())),
            Multibinding::IntoMap(_) => Some(Key::map_of(self.key())),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Descriptor::Provider(p) => p.scope,
            Descriptor::Binding(b) => b.scope,
        }
    }

    pub fn multibinding(&self) -> &Multibinding {
        match self {
            Descriptor::Provider(p) => &p.multibinding,
            Descriptor::Binding(b) => &b.multibinding,
        }
    }

    pub fn declaration(&self) -> &Declaration {
        match self {
            Descriptor::Provider(p) => &p.declaration,
            Descriptor::Binding(b) => &b.declaration,
        }
    }

    pub fn owner(&self) -> ModuleInstanceId {
        match self {
            Descriptor::Provider(p) => p.owner,
            Descriptor::Binding(b) => b.owner,
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Descriptor::Provider(p) => f
                .debug_struct("Provider")
                .field("key", &p.key)
                .field("dependencies", &p.dependencies)
                .field("scope", &p.scope)
                .field("multibinding", &p.multibinding)
                .field("owner", &p.owner)
                .finish_non_exhaustive(),
            Descriptor::Binding(b) => f
                .debug_struct("Binding")
                .field("target", &b.target)
                .field("source", &b.source)
                .field("scope", &b.scope)
                .field("multibinding", &b.multibinding)
                .field("owner", &b.owner)
                .finish(),
        }
    }
}

/// All descriptors contributed by a sequence of module sources.
///
/// Descriptors keep registration order: sources in the order they were
/// added, declarations in the order each module made them, and installed
/// modules right after the module installing them.
#[derive(Debug, Default)]
pub struct DescriptorSet {
    descriptors: Vec<Descriptor>,
    module_types: HashSet<TypeId>,
    module_instances: Vec<ModuleHandle>,
    next_owner: usize,
}

impl DescriptorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sources<I>(sources: I) -> Result<Self>
    where
        I: IntoIterator<Item = ModuleSource>,
    {
        let mut set = Self::new();
        for source in sources {
            set.add(source)?;
        }
        Ok(set)
    }

    /// Normalizes the declarations of `source` into this set.
    ///
    /// A module type given twice, or the same shared instance given twice,
    /// contributes once.
    pub fn add(&mut self, source: ModuleSource) -> Result<()> {
        let module = source.module_id();
        let instance = match source {
            ModuleSource::Type(ty) => {
                if !self.module_types.insert(module.type_id) {
                    tracing::warn!("module `{}` is already registered, skipping", module.name);
                    return Ok(());
                }
                ty.instantiate()?
            }
            ModuleSource::Instance(instance) => instance,
        };
        let handle = instance.handle();
        if self.module_instances.iter().any(|known| known.same(&handle)) {
            tracing::warn!(
                "module instance `{}` is already registered, skipping",
                module.name
            );
            return Ok(());
        }
        self.module_instances.push(handle);
        let owner = ModuleInstanceId(self.next_owner);
        self.next_owner += 1;

        let before = self.descriptors.len();
        let installed = instance.declare(owner, &mut self.descriptors)?;
        tracing::debug!(
            "module `{}` declared {} binding(s)",
            module.name,
            self.descriptors.len() - before
        );
        for source in installed {
            self.add(source)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        error::InjectError,
        module::{Binder, Module},
    };

    #[derive(Default)]
    struct Strings;

    impl Module for Strings {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder.provides::<String>("string").to(|_, _| Ok("bound".to_string()));
            binder
                .binds::<dyn fmt::Display>("display")
                .singleton()
                .from(Key::of::<String>());
        }
    }

    #[derive(Default)]
    struct Counting {
        count: AtomicUsize,
    }

    impl Module for Counting {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder.provides::<usize>("next").to(|module, _| {
                Ok(module.count.fetch_add(1, Ordering::SeqCst) + 1)
            });
        }
    }

    #[derive(Default)]
    struct Installer;

    impl Module for Installer {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder.install(ModuleSource::of::<Strings>());
            binder
                .binds::<dyn std::any::Any>("any")
                .into_set()
                .from(Key::of::<String>());
        }
    }

    #[test]
    fn declarations_are_normalized_in_order() {
        let set = DescriptorSet::from_sources([ModuleSource::of::<Strings>()]).unwrap();
        let descriptors: Vec<&Descriptor> = set.iter().collect();

        assert_eq!(descriptors.len(), 2);
        assert!(matches!(descriptors[0], Descriptor::Provider(_)));
        assert_eq!(descriptors[0].key(), &Key::of::<String>());
        assert!(descriptors[0].declaration().is_method::<Strings>("string", &[]));

        let Descriptor::Binding(alias) = descriptors[1] else {
            panic!("expected an alias, got {:?}", descriptors[1]);
        };
        assert_eq!(alias.source, Key::of::<String>());
        assert_eq!(alias.scope, Scope::Singleton);
        assert!(
            alias
                .declaration
                .is_method::<Strings>("display", &[Key::of::<String>()])
        );
    }

    #[test]
    fn duplicate_module_types_contribute_once() {
        let set = DescriptorSet::from_sources([
            ModuleSource::of::<Strings>(),
            ModuleSource::of::<Strings>(),
        ])
        .unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn shared_instances_contribute_once_and_keep_their_owner() {
        let counting = Arc::new(Counting::default());
        let set = DescriptorSet::from_sources([
            ModuleSource::shared(counting.clone()),
            ModuleSource::shared(counting.clone()),
            ModuleSource::instance(Counting::default()),
        ])
        .unwrap();

        let owners: Vec<ModuleInstanceId> = set.iter().map(Descriptor::owner).collect();
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
    }

    #[test]
    fn installed_modules_follow_their_installer() {
        let set = DescriptorSet::from_sources([
            ModuleSource::of::<Installer>(),
            ModuleSource::of::<Strings>(),
        ])
        .unwrap();
        let methods: Vec<&str> = set.iter().map(|d| d.declaration().method()).collect();
        assert_eq!(methods, vec!["any", "string", "display"]);
        assert_eq!(
            set.iter().next().and_then(Descriptor::collection_key),
            Some(Key::set_of(&Key::of::<dyn std::any::Any>()))
        );
    }

    #[derive(Default)]
    struct AliasOnly;

    impl Module for AliasOnly {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder
                .binds::<dyn fmt::Debug>("debug")
                .from(Key::of::<String>());
        }
    }

    #[derive(Default)]
    struct OtherAliasOnly;

    impl Module for OtherAliasOnly {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder
                .binds::<dyn fmt::Display>("display")
                .from(Key::of::<String>());
        }
    }

    #[derive(Default)]
    struct OnlyInstalls;

    impl Module for OnlyInstalls {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder.install(ModuleSource::of::<Counting>());
        }
    }

    #[test]
    fn stateless_modules_are_never_mistaken_for_each_other() {
        let set = DescriptorSet::from_sources([
            ModuleSource::of::<AliasOnly>(),
            ModuleSource::of::<OtherAliasOnly>(),
            ModuleSource::instance(AliasOnly),
        ])
        .unwrap();
        let methods: Vec<&str> = set.iter().map(|d| d.declaration().method()).collect();
        // a separate instance of a registered type still contributes
        assert_eq!(methods, vec!["debug", "display", "debug"]);
    }

    #[test]
    fn module_that_only_installs_keeps_the_installed_declarations() {
        let set = DescriptorSet::from_sources([ModuleSource::of::<OnlyInstalls>()]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(
            set.iter()
                .next()
                .is_some_and(|d| d.declaration().is_method::<Counting>("next", &[]))
        );
    }

    #[test]
    fn failing_constructor_is_a_module_instantiation_error() {
        let source =
            ModuleSource::with_constructor(|| -> anyhow::Result<Strings> {
                anyhow::bail!("no default profile")
            });
        let err = DescriptorSet::from_sources([source]).unwrap_err();
        assert!(matches!(
            err,
            InjectError::ModuleInstantiation { module, .. } if module.ends_with("Strings")
        ));
    }
}
