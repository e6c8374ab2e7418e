use std::{fmt, marker::PhantomData, sync::Arc};

use crate::{
    descriptor::{
        BindingDescriptor, Declaration, Dependency, Descriptor, Factory, ModuleId,
        ModuleInstanceId, Multibinding, ProviderDescriptor, Scope,
    },
    error::{InjectError, Result},
    injector::{Dependencies, Instance},
    key::{Key, Qualifier},
};

/// a module declaring providers and bindings.
///
/// # Example
/// ```
/// use beaver_inject::{Binder, Key, Module};
///
/// pub struct GreetingModule;
///
/// impl Module for GreetingModule {
///     fn configure(&self, binder: &mut Binder<'_, Self>) {
///         binder
///             .provides::<String>("greeting")
///             .to(|_, _| Ok("hello".to_string()));
///         binder
///             .binds::<dyn std::fmt::Display>("display")
///             .from(Key::of::<String>());
///     }
/// }
/// ```
pub trait Module: Send + Sync + Sized + 'static {
    /// Declares this module's bindings.
    ///
    /// Provider factories receive `&Self`, so state kept in the module
    /// instance is shared by every declaration of that instance.
    fn configure(&self, binder: &mut Binder<'_, Self>);
}

/// A module handed to the injector: either a type the injector constructs, or
/// an instance constructed by the caller.
pub enum ModuleSource {
    Type(ModuleType),
    Instance(ModuleInstance),
}

impl ModuleSource {
    /// A module type constructed with `Default`.
    pub fn of<M: Module + Default>() -> Self {
        Self::with_constructor(|| Ok(M::default()))
    }

    /// A module type constructed by `constructor` when the injector is built.
    pub fn with_constructor<M, F>(constructor: F) -> Self
    where
        M: Module,
        F: FnOnce() -> anyhow::Result<M> + Send + 'static,
    {
        ModuleSource::Type(ModuleType {
            module: ModuleId::of::<M>(),
            construct: Box::new(move || {
                let module = constructor()?;
                Ok(ModuleInstance::from_arc(Arc::new(module)))
            }),
        })
    }

    pub fn instance<M: Module>(module: M) -> Self {
        Self::shared(Arc::new(module))
    }

    /// An instance the caller keeps a handle to; giving the same instance
    /// twice registers it once.
    pub fn shared<M: Module>(module: Arc<M>) -> Self {
        ModuleSource::Instance(ModuleInstance::from_arc(module))
    }

    pub fn module_id(&self) -> ModuleId {
        match self {
            ModuleSource::Type(ty) => ty.module,
            ModuleSource::Instance(instance) => instance.module,
        }
    }
}

pub struct ModuleType {
    module: ModuleId,
    construct: Box<dyn FnOnce() -> anyhow::Result<ModuleInstance> + Send>,
}

impl ModuleType {
    pub(crate) fn instantiate(self) -> Result<ModuleInstance> {
        let module = self.module;
        (self.construct)().map_err(|source| InjectError::ModuleInstantiation {
            module: module.name(),
            source,
        })
    }
}

pub struct ModuleInstance {
    module: ModuleId,
    inner: Arc<dyn ErasedModule>,
}

impl ModuleInstance {
    fn from_arc<M: Module>(module: Arc<M>) -> Self {
        Self {
            module: ModuleId::of::<M>(),
            inner: module,
        }
    }

    pub(crate) fn handle(&self) -> ModuleHandle {
        ModuleHandle(self.inner.clone())
    }

    pub(crate) fn declare(
        self,
        owner: ModuleInstanceId,
        descriptors: &mut Vec<Descriptor>,
    ) -> Result<Vec<ModuleSource>> {
        self.inner.declare(owner, descriptors)
    }
}

/// Keeps a registered module instance alive. Two handles are the same when
/// they point at the same instance.
#[derive(Clone)]
pub(crate) struct ModuleHandle(Arc<dyn ErasedModule>);

impl ModuleHandle {
    pub(crate) fn same(&self, other: &ModuleHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleHandle")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

trait ErasedModule: Send + Sync {
    fn declare(
        self: Arc<Self>,
        owner: ModuleInstanceId,
        descriptors: &mut Vec<Descriptor>,
    ) -> Result<Vec<ModuleSource>>;
}

impl<M: Module> ErasedModule for M {
    fn declare(
        self: Arc<Self>,
        owner: ModuleInstanceId,
        descriptors: &mut Vec<Descriptor>,
    ) -> Result<Vec<ModuleSource>> {
        let mut binder = Binder {
            module: self.clone(),
            owner,
            descriptors,
            installed: Vec::new(),
            error: None,
        };
        self.configure(&mut binder);
        match binder.error {
            Some(err) => Err(err),
            None => Ok(binder.installed),
        }
    }
}

/// Collects the declarations of one module instance.
pub struct Binder<'a, M: Module> {
    module: Arc<M>,
    owner: ModuleInstanceId,
    descriptors: &'a mut Vec<Descriptor>,
    installed: Vec<ModuleSource>,
    error: Option<InjectError>,
}

impl<'a, M: Module> Binder<'a, M> {
    /// Declares a provider of `T` named `method`.
    pub fn provides<T>(&mut self, method: &'static str) -> Provides<'_, 'a, M, T>
    where
        T: Send + Sync + 'static,
    {
        Provides {
            binder: self,
            method,
            key: Key::of::<T>(),
            dependencies: Vec::new(),
            scope: Scope::Unscoped,
            multibinding: Multibinding::Plain,
            _marker: PhantomData,
        }
    }

    /// Declares an alias exposing `T` named `method`.
    pub fn binds<T: ?Sized + 'static>(&mut self, method: &'static str) -> Binds<'_, 'a, M> {
        self.binds_key(method, Key::of::<T>())
    }

    /// Declares an alias exposing an explicit key.
    pub fn binds_key(&mut self, method: &'static str, key: Key) -> Binds<'_, 'a, M> {
        Binds {
            binder: self,
            method,
            key,
            scope: Scope::Unscoped,
            multibinding: Multibinding::Plain,
        }
    }

    /// Registers another module after this one.
    pub fn install(&mut self, source: ModuleSource) {
        self.installed.push(source);
    }

    fn declaration(&self, method: &'static str, parameters: Vec<Key>, key: Key) -> Declaration {
        Declaration::new(ModuleId::of::<M>(), method, parameters, key)
    }

    fn record_error(&mut self, method: &'static str, err: InjectError) {
        if self.error.is_some() {
            return;
        }
        let err = match err {
            InjectError::InvalidQualifier { qualifier, reason } => {
                InjectError::InvalidQualifier {
                    qualifier,
                    reason: format!(
                        "{} (declared by {}::{})",
                        reason,
                        ModuleId::of::<M>().name(),
                        method
                    ),
                }
            }
            other => other,
        };
        self.error = Some(err);
    }
}

/// A provider declaration; finished with [`Provides::to`].
#[must_use = "a provider is only declared once `to` is called"]
pub struct Provides<'b, 'a, M: Module, T> {
    binder: &'b mut Binder<'a, M>,
    method: &'static str,
    key: Key,
    dependencies: Vec<Dependency>,
    scope: Scope,
    multibinding: Multibinding,
    _marker: PhantomData<fn() -> T>,
}

impl<'b, 'a, M: Module, T: Send + Sync + 'static> Provides<'b, 'a, M, T> {
    pub fn qualified(mut self, qualifier: Qualifier) -> Self {
        self.key = self.key.qualified(qualifier);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        match Qualifier::named(name) {
            Ok(qualifier) => self.key = self.key.qualified(qualifier),
            Err(err) => self.binder.record_error(self.method, err),
        }
        self
    }

    pub fn singleton(mut self) -> Self {
        self.scope = Scope::Singleton;
        self
    }

    pub fn into_set(mut self) -> Self {
        self.multibinding = Multibinding::IntoSet;
        self
    }

    pub fn into_map(mut self, map_key: &str) -> Self {
        self.multibinding = Multibinding::IntoMap(Arc::from(map_key));
        self
    }

    pub fn depends_on(mut self, key: Key) -> Self {
        self.dependencies.push(Dependency::new(key, false));
        self
    }

    /// Depends on `key` without resolving it up front; the factory gets a
    /// [`Lazy`](crate::Lazy) handle instead.
    pub fn depends_on_lazy(mut self, key: Key) -> Self {
        self.dependencies.push(Dependency::new(key, true));
        self
    }

    pub fn to<F>(self, factory: F)
    where
        F: Fn(&M, &Dependencies) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let module = self.binder.module.clone();
        let factory: Factory = Arc::new(move |deps: &Dependencies| -> anyhow::Result<Instance> {
            Ok(Instance::new(factory(module.as_ref(), deps)?))
        });
        let parameters = self
            .dependencies
            .iter()
            .map(|dep| dep.key().clone())
            .collect();
        let declaration = self
            .binder
            .declaration(self.method, parameters, self.key.clone());
        let owner = self.binder.owner;
        self.binder
            .descriptors
            .push(Descriptor::Provider(ProviderDescriptor {
                key: self.key,
                dependencies: self.dependencies,
                factory,
                scope: self.scope,
                multibinding: self.multibinding,
                declaration,
                owner,
            }));
    }
}

/// An alias declaration; finished with [`Binds::from`].
#[must_use = "an alias is only declared once `from` is called"]
pub struct Binds<'b, 'a, M: Module> {
    binder: &'b mut Binder<'a, M>,
    method: &'static str,
    key: Key,
    scope: Scope,
    multibinding: Multibinding,
}

impl<'b, 'a, M: Module> Binds<'b, 'a, M> {
    pub fn qualified(mut self, qualifier: Qualifier) -> Self {
        self.key = self.key.qualified(qualifier);
        self
    }

    pub fn named(mut self, name: &str) -> Self {
        match Qualifier::named(name) {
            Ok(qualifier) => self.key = self.key.qualified(qualifier),
            Err(err) => self.binder.record_error(self.method, err),
        }
        self
    }

    pub fn singleton(mut self) -> Self {
        self.scope = Scope::Singleton;
        self
    }

    pub fn into_set(mut self) -> Self {
        self.multibinding = Multibinding::IntoSet;
        self
    }

    pub fn into_map(mut self, map_key: &str) -> Self {
        self.multibinding = Multibinding::IntoMap(Arc::from(map_key));
        self
    }

    /// Delegates to `source`: the value of `source` is exposed unchanged.
    pub fn from(self, source: Key) {
        let declaration =
            self.binder
                .declaration(self.method, vec![source.clone()], self.key.clone());
        let owner = self.binder.owner;
        self.binder
            .descriptors
            .push(Descriptor::Binding(BindingDescriptor {
                target: self.key,
                source,
                scope: self.scope,
                multibinding: self.multibinding,
                declaration,
                owner,
            }));
    }
}
