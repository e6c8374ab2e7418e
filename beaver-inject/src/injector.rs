use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard, PoisonError, Weak},
    thread::{self, ThreadId},
};

use crate::{
    config::{InjectorConfig, Stage},
    descriptor::{Declaration, DescriptorSet, Scope},
    error::{InjectError, Result},
    graph::{BindingNode, Graph, GraphBuilder, NodeId, NodeKind},
    key::Key,
    module::ModuleSource,
    multibinding::Multibound,
};

/// A provided value.
///
/// Aliases hand their source's value through unchanged, so an `Instance`
/// always holds whatever concrete type the underlying factory produced.
#[derive(Clone)]
pub struct Instance(Arc<dyn Any + Send + Sync>);

impl Instance {
    pub fn new<T: Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn is<T: Any>(&self) -> bool {
        (*self.0).is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        (*self.0).downcast_ref::<T>()
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    /// Whether both handles point at the same value.
    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance").finish_non_exhaustive()
    }
}

enum Resolved {
    Ready(Instance),
    Lazy(Lazy),
}

/// The dependency values handed to a provider factory, in declaration order.
pub struct Dependencies {
    keys: Vec<Key>,
    values: Vec<Resolved>,
}

impl Dependencies {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn key(&self, index: usize) -> &Key {
        &self.keys[index]
    }

    /// The dependency at `index` as a `T`. Lazy dependencies are resolved on
    /// the spot.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn get<T: Send + Sync + 'static>(&self, index: usize) -> Result<Arc<T>> {
        let instance = self.instance(index)?;
        instance
            .downcast::<T>()
            .ok_or_else(|| InjectError::TypeMismatch {
                key: self.keys[index].clone(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// # Panics
    /// Panics if `index` is out of range.
    pub fn instance(&self, index: usize) -> Result<Instance> {
        match &self.values[index] {
            Resolved::Ready(instance) => Ok(instance.clone()),
            Resolved::Lazy(lazy) => lazy.get(),
        }
    }

    /// The unresolved handle of a lazy dependency.
    ///
    /// # Panics
    /// Panics if `index` is out of range.
    pub fn lazy(&self, index: usize) -> Option<Lazy> {
        match &self.values[index] {
            Resolved::Lazy(lazy) => Some(lazy.clone()),
            Resolved::Ready(_) => None,
        }
    }
}

/// A deferred dependency. Each [`Lazy::get`] resolves the binding anew,
/// subject to its scope.
#[derive(Clone)]
pub struct Lazy {
    graph: Weak<Graph>,
    node: NodeId,
    key: Key,
}

impl Lazy {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn get(&self) -> Result<Instance> {
        let graph = self
            .graph
            .upgrade()
            .ok_or_else(|| InjectError::InjectorDropped {
                key: self.key.clone(),
            })?;
        resolve(&graph, self.node)
    }
}

impl fmt::Debug for Lazy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lazy").field("key", &self.key).finish()
    }
}

enum SlotState {
    Empty,
    InFlight,
    Ready(Instance),
}

/// Cache of a singleton node.
///
/// Concurrent first requests converge on one evaluation: the first caller
/// marks the slot in flight and evaluates, later callers wait for the result.
/// A caller whose wait would close a cycle of threads waiting on each other
/// fails instead. A failed evaluation leaves the slot empty.
pub(crate) struct SingletonSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Default for SingletonSlot {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState::Empty),
            ready: Condvar::new(),
        }
    }
}

impl SingletonSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_try_init<F, C>(&self, init: F, cycle: C) -> Result<Instance>
    where
        F: FnOnce() -> Result<Instance>,
        C: FnOnce() -> InjectError,
    {
        let current = thread::current().id();
        let mut state = self.lock();
        loop {
            match &*state {
                SlotState::Ready(instance) => return Ok(instance.clone()),
                SlotState::Empty => break,
                SlotState::InFlight => {}
            }
            let Some(_waiting) = Waiting::register(current, self.address()) else {
                return Err(cycle());
            };
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state = SlotState::InFlight;
        wait_for().owners.insert(self.address(), current);
        drop(state);

        let mut flight = InFlight { slot: self, done: false };
        let result = init();
        let mut state = self.lock();
        *state = match &result {
            Ok(instance) => SlotState::Ready(instance.clone()),
            Err(_) => SlotState::Empty,
        };
        wait_for().owners.remove(&self.address());
        flight.done = true;
        drop(state);
        self.ready.notify_all();
        result
    }

    fn is_ready(&self) -> bool {
        matches!(*self.lock(), SlotState::Ready(_))
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }
}

// Resets the slot if the evaluation unwinds, so waiters do not hang.
struct InFlight<'s> {
    slot: &'s SingletonSlot,
    done: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut state = self.slot.lock();
            *state = SlotState::Empty;
            wait_for().owners.remove(&self.slot.address());
            drop(state);
            self.slot.ready.notify_all();
        }
    }
}

#[derive(Default)]
struct WaitFor {
    // slot address -> thread evaluating it
    owners: HashMap<usize, ThreadId>,
    // thread -> address of the slot it is blocked on
    blocked: HashMap<ThreadId, usize>,
}

static WAIT_FOR: LazyLock<Mutex<WaitFor>> = LazyLock::new(Default::default);

fn wait_for() -> MutexGuard<'static, WaitFor> {
    WAIT_FOR.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Records that a thread is blocked on a slot another thread is evaluating.
struct Waiting(ThreadId);

impl Waiting {
    /// `None` if the thread evaluating `slot` already waits, directly or
    /// through other threads, on `waiter`.
    fn register(waiter: ThreadId, slot: usize) -> Option<Self> {
        let mut graph = wait_for();
        let mut awaited = slot;
        // bounded so a chain left by threads that have not woken yet cannot spin
        for _ in 0..=graph.blocked.len() {
            let Some(&owner) = graph.owners.get(&awaited) else {
                break;
            };
            if owner == waiter {
                return None;
            }
            match graph.blocked.get(&owner) {
                Some(&next) => awaited = next,
                None => break,
            }
        }
        graph.blocked.insert(waiter, slot);
        Some(Waiting(waiter))
    }
}

impl Drop for Waiting {
    fn drop(&mut self) {
        wait_for().blocked.remove(&self.0);
    }
}

thread_local! {
    // (graph address, node) for every evaluation running on this thread.
    static ACTIVE: RefCell<Vec<(usize, NodeId)>> = const { RefCell::new(Vec::new()) };
}

struct ActiveGuard;

impl ActiveGuard {
    fn enter(graph: &Arc<Graph>, node: NodeId) -> Result<Self> {
        let address = Arc::as_ptr(graph) as usize;
        ACTIVE.with(|active| {
            let mut active = active.borrow_mut();
            if let Some(start) = active.iter().position(|&entry| entry == (address, node)) {
                let mut path: Vec<Key> = active[start..]
                    .iter()
                    .filter(|(owner, _)| *owner == address)
                    .map(|&(_, id)| graph.node(id).key.clone())
                    .collect();
                path.push(graph.node(node).key.clone());
                return Err(InjectError::CyclicBinding { path });
            }
            active.push((address, node));
            Ok(ActiveGuard)
        })
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|active| {
            active.borrow_mut().pop();
        });
    }
}

fn resolve(graph: &Arc<Graph>, id: NodeId) -> Result<Instance> {
    let _active = ActiveGuard::enter(graph, id)?;
    match &graph.node(id).slot {
        Some(slot) => slot.get_or_try_init(
            || evaluate(graph, id),
            || InjectError::CyclicBinding {
                path: active_path(graph),
            },
        ),
        None => evaluate(graph, id),
    }
}

// Keys on this thread's resolution path through `graph`, outermost first.
fn active_path(graph: &Arc<Graph>) -> Vec<Key> {
    let address = Arc::as_ptr(graph) as usize;
    ACTIVE.with(|active| {
        active
            .borrow()
            .iter()
            .filter(|(owner, _)| *owner == address)
            .map(|&(_, id)| graph.node(id).key.clone())
            .collect()
    })
}

fn evaluate(graph: &Arc<Graph>, id: NodeId) -> Result<Instance> {
    let node = graph.node(id);
    tracing::trace!("evaluating {}", node.key);
    match &node.kind {
        NodeKind::Alias { source } => resolve(graph, *source),
        NodeKind::Provider {
            factory,
            dependencies,
        } => {
            let mut keys = Vec::with_capacity(dependencies.len());
            let mut values = Vec::with_capacity(dependencies.len());
            for edge in dependencies {
                let key = graph.node(edge.node).key.clone();
                if edge.lazy {
                    values.push(Resolved::Lazy(Lazy {
                        graph: Arc::downgrade(graph),
                        node: edge.node,
                        key: key.clone(),
                    }));
                } else {
                    values.push(Resolved::Ready(resolve(graph, edge.node)?));
                }
                keys.push(key);
            }
            factory(&Dependencies { keys, values }).map_err(|err| provision_error(node, err))
        }
        NodeKind::Collection {
            kind,
            contributions,
        } => {
            let mut entries = Vec::with_capacity(contributions.len());
            for (map_key, contribution) in contributions {
                entries.push((map_key.clone(), resolve(graph, *contribution)?));
            }
            Ok(Instance::new(Multibound::new(*kind, entries)))
        }
    }
}

// Resolution errors raised inside a factory (a cycle through a lazy handle,
// most notably) keep their own identity instead of becoming provision errors.
fn provision_error(node: &BindingNode, err: anyhow::Error) -> InjectError {
    let source = match err.downcast::<InjectError>() {
        Ok(err @ (InjectError::CyclicBinding { .. } | InjectError::InjectorDropped { .. })) => {
            return err;
        }
        Ok(other) => anyhow::Error::new(other),
        Err(source) => source,
    };
    InjectError::Provision {
        key: node.key.clone(),
        declaration: node.declaration.clone(),
        source,
    }
}

/// A resolved binding: one node of the injector's graph.
#[derive(Clone)]
pub struct Binding {
    graph: Arc<Graph>,
    node: NodeId,
}

impl Binding {
    pub fn key(&self) -> &Key {
        &self.graph.node(self.node).key
    }

    pub fn scope(&self) -> Scope {
        self.graph.node(self.node).scope
    }

    /// The declaration that bound this key: the alias method for an alias,
    /// not the provider it delegates to. `None` for a multibinding.
    pub fn source(&self) -> Option<&Declaration> {
        self.graph.node(self.node).declaration.as_ref()
    }

    /// Every declaration traversed to produce this binding's value, starting
    /// with [`Binding::source`].
    pub fn provenance(&self) -> &[Declaration] {
        &self.graph.node(self.node).provenance
    }

    /// Keys this binding depends on directly.
    pub fn dependencies(&self) -> Vec<Key> {
        self.graph
            .node(self.node)
            .edges()
            .into_iter()
            .map(|edge| self.graph.node(edge.node).key.clone())
            .collect()
    }

    pub fn is_multibinding(&self) -> bool {
        matches!(
            self.graph.node(self.node).kind,
            NodeKind::Collection { .. }
        )
    }

    pub fn provided_value(&self) -> Result<Instance> {
        resolve(&self.graph, self.node)
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", self.key())
            .field("scope", &self.scope())
            .field("source", &self.source())
            .finish()
    }
}

/// The resolved, immutable binding graph.
///
/// Cloning is cheap; clones share the graph and its singletons.
#[derive(Clone)]
pub struct Injector {
    graph: Arc<Graph>,
}

/// Builds an injector from `sources` with the default configuration.
pub fn build_injector<I>(sources: I) -> Result<Injector>
where
    I: IntoIterator<Item = ModuleSource>,
{
    Injector::create(sources, &InjectorConfig::default())
}

impl Injector {
    pub fn create<I>(sources: I, config: &InjectorConfig) -> Result<Self>
    where
        I: IntoIterator<Item = ModuleSource>,
    {
        let descriptors = DescriptorSet::from_sources(sources)?;
        let graph = GraphBuilder::new(&descriptors).build()?;
        let injector = Self {
            graph: Arc::new(graph),
        };
        if config.log_bindings() {
            for binding in injector.bindings() {
                match binding.source() {
                    Some(source) => tracing::info!("bound {} at {}", binding.key(), source),
                    None => tracing::info!(
                        "bound {} from {} contribution(s)",
                        binding.key(),
                        binding.dependencies().len()
                    ),
                }
            }
        }
        if config.stage() == Stage::Production {
            injector.initialize_singletons()?;
        }
        Ok(injector)
    }

    /// Evaluates every singleton now instead of on first request.
    fn initialize_singletons(&self) -> Result<()> {
        let mut count = 0;
        for (id, node) in self.graph.nodes.iter().enumerate() {
            if node.slot.is_some() {
                resolve(&self.graph, id)?;
                count += 1;
            }
        }
        tracing::debug!("initialized {} singleton(s)", count);
        Ok(())
    }

    pub fn binding(&self, key: &Key) -> Result<Binding> {
        self.graph
            .lookup(key)
            .map(|node| Binding {
                graph: self.graph.clone(),
                node,
            })
            .ok_or_else(|| InjectError::UnknownBinding { key: key.clone() })
    }

    pub fn resolve_value(&self, binding: &Binding) -> Result<Instance> {
        binding.provided_value()
    }

    pub fn instance(&self, key: &Key) -> Result<Instance> {
        self.binding(key)?.provided_value()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.graph.lookup(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.graph.index.keys()
    }

    /// Every keyed binding, in registration order.
    pub fn bindings(&self) -> impl Iterator<Item = Binding> + '_ {
        let mut nodes: Vec<NodeId> = self.graph.index.values().copied().collect();
        nodes.sort_unstable();
        nodes.into_iter().map(|node| Binding {
            graph: self.graph.clone(),
            node,
        })
    }

    /// Whether the singleton bound to `key` has been evaluated.
    pub fn is_initialized(&self, key: &Key) -> bool {
        self.graph
            .lookup(key)
            .and_then(|node| self.graph.node(node).slot.as_ref())
            .is_some_and(SingletonSlot::is_ready)
    }
}

impl fmt::Debug for Injector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Injector")
            .field("bindings", &self.graph.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier,
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        thread,
        time::Duration,
    };

    use rstest::rstest;

    use super::*;
    use crate::{
        module::{Binder, Module},
        multibinding::CollectionKind,
    };

    #[derive(Default)]
    struct Counters {
        unscoped: AtomicUsize,
        singleton: AtomicUsize,
    }

    impl Module for Counters {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder.provides::<usize>("unscoped").to(|module, _| {
                Ok(module.unscoped.fetch_add(1, Ordering::SeqCst))
            });
            binder
                .provides::<u64>("singleton")
                .singleton()
                .to(|module, _| {
                    thread::sleep(Duration::from_millis(20));
                    Ok(module.singleton.fetch_add(1, Ordering::SeqCst) as u64)
                });
            binder.binds::<u32>("unscoped_alias").from(Key::of::<usize>());
            binder.binds::<u16>("singleton_alias").from(Key::of::<u64>());
        }
    }

    #[derive(Default)]
    struct Flaky {
        attempts: AtomicUsize,
    }

    impl Module for Flaky {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder
                .provides::<String>("connection")
                .singleton()
                .to(|module, _| {
                    if module.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        anyhow::bail!("connection refused");
                    }
                    Ok("connected".to_string())
                });
        }
    }

    // u32 reaches itself through a lazy u64 handle
    #[derive(Default)]
    struct LazySelf;

    impl Module for LazySelf {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder
                .provides::<u32>("small")
                .singleton()
                .depends_on_lazy(Key::of::<u64>())
                .to(|_, deps| Ok(*deps.get::<u64>(0)? as u32));
            binder.binds::<u64>("large").from(Key::of::<u32>());
        }
    }

    // u32 and u64 each reach the other through a lazy handle
    #[derive(Default)]
    struct CrossLazy;

    impl Module for CrossLazy {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder
                .provides::<u32>("small")
                .singleton()
                .depends_on_lazy(Key::of::<u64>())
                .to(|_, deps| {
                    thread::sleep(Duration::from_millis(100));
                    Ok(*deps.get::<u64>(0)? as u32)
                });
            binder
                .provides::<u64>("large")
                .singleton()
                .depends_on_lazy(Key::of::<u32>())
                .to(|_, deps| {
                    thread::sleep(Duration::from_millis(100));
                    Ok(u64::from(*deps.get::<u32>(0)?))
                });
        }
    }

    struct Holder(Lazy);

    #[derive(Default)]
    struct Holding;

    impl Module for Holding {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder.provides::<String>("name").to(|_, _| Ok("beaver".to_string()));
            binder
                .provides::<Holder>("holder")
                .depends_on_lazy(Key::of::<String>())
                .to(|_, deps| {
                    let lazy = deps
                        .lazy(0)
                        .ok_or_else(|| anyhow::anyhow!("expected a lazy dependency"))?;
                    Ok(Holder(lazy))
                });
            binder
                .provides::<usize>("mismatch")
                .depends_on(Key::of::<String>())
                .to(|_, deps| Ok(*deps.get::<usize>(0)?));
        }
    }

    #[derive(Default)]
    struct Plugins;

    impl Module for Plugins {
        fn configure(&self, binder: &mut Binder<'_, Self>) {
            binder
                .provides::<&'static str>("first")
                .into_set()
                .to(|_, _| Ok("first"));
            binder
                .provides::<&'static str>("second")
                .into_set()
                .to(|_, _| Ok("second"));
            binder
                .provides::<u8>("low")
                .into_map("low")
                .to(|_, _| Ok(1));
            binder
                .provides::<u8>("high")
                .into_map("high")
                .to(|_, _| Ok(9));
        }
    }

    fn counters() -> (Arc<Counters>, Injector) {
        let module = Arc::new(Counters::default());
        let injector = build_injector([ModuleSource::shared(module.clone())]).unwrap();
        (module, injector)
    }

    #[test]
    fn unscoped_bindings_are_evaluated_per_request() {
        let (module, injector) = counters();
        let key = Key::of::<usize>();
        let first = injector.instance(&key).unwrap();
        let second = injector.instance(&key).unwrap();
        assert_eq!(first.downcast_ref::<usize>(), Some(&0));
        assert_eq!(second.downcast_ref::<usize>(), Some(&1));
        assert_eq!(module.unscoped.load(Ordering::SeqCst), 2);
        assert!(!injector.is_initialized(&key));
    }

    #[rstest]
    #[case::provider(Key::of::<u64>())]
    #[case::alias(Key::of::<u16>())]
    fn singletons_are_evaluated_once(#[case] key: Key) {
        let (module, injector) = counters();
        let first = injector.instance(&key).unwrap();
        let second = injector.instance(&key).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(module.singleton.load(Ordering::SeqCst), 1);
        assert!(injector.is_initialized(&Key::of::<u64>()));
    }

    #[test]
    fn alias_hands_through_its_source_value() {
        let (module, injector) = counters();
        let alias = injector.instance(&Key::of::<u32>()).unwrap();
        // the alias exposes the provider's usize, not a converted u32
        assert_eq!(alias.downcast_ref::<usize>(), Some(&0));
        assert!(!alias.is::<u32>());
        injector.instance(&Key::of::<u32>()).unwrap();
        assert_eq!(module.unscoped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_first_requests_share_one_evaluation() {
        let (module, injector) = counters();
        let barrier = Barrier::new(8);
        let values: Vec<Instance> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        injector.instance(&Key::of::<u64>()).unwrap()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(module.singleton.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|value| value.ptr_eq(&values[0])));
    }

    #[test]
    fn failed_singleton_is_retried_on_next_request() {
        let injector = build_injector([ModuleSource::of::<Flaky>()]).unwrap();
        let key = Key::of::<String>();

        let err = injector.instance(&key).unwrap_err();
        let InjectError::Provision {
            key: failed,
            declaration,
            source,
        } = &err
        else {
            panic!("expected a provision error, got {err}");
        };
        assert_eq!(*failed, key);
        assert!(
            declaration
                .as_ref()
                .is_some_and(|d| d.is_method::<Flaky>("connection", &[]))
        );
        assert_eq!(source.to_string(), "connection refused");
        assert!(!injector.is_initialized(&key));

        let value = injector.instance(&key).unwrap();
        assert_eq!(value.downcast_ref::<String>().unwrap(), "connected");
        assert!(injector.is_initialized(&key));
    }

    #[test]
    fn lazy_reentry_is_a_cycle_at_resolution() {
        let injector = build_injector([ModuleSource::of::<LazySelf>()]).unwrap();
        let err = injector.instance(&Key::of::<u32>()).unwrap_err();
        let InjectError::CyclicBinding { path } = &err else {
            panic!("expected a cycle, got {err}");
        };
        assert_eq!(
            path,
            &vec![Key::of::<u32>(), Key::of::<u64>(), Key::of::<u32>()]
        );
        // the slot is usable again, and fails the same way
        assert!(!injector.is_initialized(&Key::of::<u32>()));
        assert!(matches!(
            injector.instance(&Key::of::<u64>()),
            Err(InjectError::CyclicBinding { .. })
        ));
    }

    #[test]
    fn threads_waiting_on_each_other_fail_with_a_cycle() {
        let injector = build_injector([ModuleSource::of::<CrossLazy>()]).unwrap();
        let barrier = Arc::new(Barrier::new(2));
        let (sender, receiver) = mpsc::channel();
        let workers: Vec<_> = [Key::of::<u32>(), Key::of::<u64>()]
            .into_iter()
            .map(|key| {
                let injector = injector.clone();
                let barrier = barrier.clone();
                let sender = sender.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let result = injector.instance(&key);
                    sender.send((key, result)).unwrap();
                })
            })
            .collect();

        for _ in 0..2 {
            let (key, result) = receiver
                .recv_timeout(Duration::from_secs(5))
                .expect("threads waiting on each other never finished");
            assert!(
                matches!(result, Err(InjectError::CyclicBinding { .. })),
                "{key} resolved to {result:?}"
            );
        }
        let ids: Vec<ThreadId> = workers.iter().map(|worker| worker.thread().id()).collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert!(ids.iter().all(|id| !wait_for().blocked.contains_key(id)));
        assert!(!injector.is_initialized(&Key::of::<u32>()));
        assert!(!injector.is_initialized(&Key::of::<u64>()));
        assert!(matches!(
            injector.instance(&Key::of::<u32>()),
            Err(InjectError::CyclicBinding { .. })
        ));
    }

    #[test]
    fn lazy_handle_resolves_until_the_injector_is_dropped() {
        let injector = build_injector([ModuleSource::of::<Holding>()]).unwrap();
        let holder = injector
            .instance(&Key::of::<Holder>())
            .unwrap()
            .downcast::<Holder>()
            .unwrap();
        assert_eq!(holder.0.key(), &Key::of::<String>());
        let name = holder.0.get().unwrap();
        assert_eq!(name.downcast_ref::<String>().unwrap(), "beaver");

        drop(injector);
        assert!(matches!(
            holder.0.get(),
            Err(InjectError::InjectorDropped { key }) if key == Key::of::<String>()
        ));
    }

    #[test]
    fn wrong_dependency_type_is_a_provision_error() {
        let injector = build_injector([ModuleSource::of::<Holding>()]).unwrap();
        let err = injector.instance(&Key::of::<usize>()).unwrap_err();
        let InjectError::Provision { source, .. } = &err else {
            panic!("expected a provision error, got {err}");
        };
        assert!(matches!(
            source.downcast_ref::<InjectError>(),
            Some(InjectError::TypeMismatch { key, .. }) if *key == Key::of::<String>()
        ));
    }

    #[test]
    fn unknown_key_leaves_the_injector_usable() {
        let (_, injector) = counters();
        assert!(matches!(
            injector.binding(&Key::of::<String>()),
            Err(InjectError::UnknownBinding { key }) if key == Key::of::<String>()
        ));
        assert!(!injector.contains(&Key::of::<String>()));
        assert!(injector.instance(&Key::of::<u64>()).is_ok());
    }

    #[test]
    fn production_stage_initializes_singletons_while_building() {
        let module = Arc::new(Counters::default());
        let config = InjectorConfig::builder().stage(Stage::Production).build();
        let injector = Injector::create([ModuleSource::shared(module.clone())], &config).unwrap();

        assert_eq!(module.singleton.load(Ordering::SeqCst), 1);
        assert_eq!(module.unscoped.load(Ordering::SeqCst), 0);
        assert!(injector.is_initialized(&Key::of::<u64>()));
        injector.instance(&Key::of::<u16>()).unwrap();
        assert_eq!(module.singleton.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn production_stage_surfaces_singleton_failures() {
        let config = InjectorConfig::builder().stage(Stage::Production).build();
        let err = Injector::create([ModuleSource::of::<Flaky>()], &config).unwrap_err();
        assert!(matches!(err, InjectError::Provision { .. }));
    }

    #[test]
    fn multibindings_collect_every_contribution_in_order() {
        let injector = build_injector([ModuleSource::of::<Plugins>()]).unwrap();

        let set_key = Key::set_of(&Key::of::<&'static str>());
        let set = injector.instance(&set_key).unwrap();
        let set = set.downcast_ref::<Multibound>().unwrap();
        assert_eq!(set.kind(), CollectionKind::Set);
        assert_eq!(set.values::<&'static str>().unwrap(), vec![&"first", &"second"]);

        let map = injector
            .instance(&Key::map_of(&Key::of::<u8>()))
            .unwrap()
            .downcast::<Multibound>()
            .unwrap();
        assert_eq!(map.kind(), CollectionKind::Map);
        assert_eq!(map.get("high").and_then(Instance::downcast_ref::<u8>), Some(&9));
        let keys: Vec<&str> = map.entries().map(|(key, _)| key).collect();
        assert_eq!(keys, vec!["low", "high"]);

        let binding = injector.binding(&set_key).unwrap();
        assert!(binding.is_multibinding());
        assert!(binding.source().is_none());
        assert_eq!(
            binding.dependencies(),
            vec![Key::of::<&'static str>(), Key::of::<&'static str>()]
        );
    }

    #[test]
    fn binding_reports_its_declaration() {
        let (_, injector) = counters();
        let alias = injector.binding(&Key::of::<u16>()).unwrap();
        assert_eq!(alias.scope(), Scope::Unscoped);
        assert!(
            alias
                .source()
                .is_some_and(|d| d.is_method::<Counters>("singleton_alias", &[Key::of::<u64>()]))
        );
        assert_eq!(alias.dependencies(), vec![Key::of::<u64>()]);
        assert_eq!(alias.provenance().len(), 2);
        assert!(!alias.is_multibinding());

        let value = injector.resolve_value(&alias).unwrap();
        assert!(value.ptr_eq(&injector.instance(&Key::of::<u64>()).unwrap()));

        let keys: Vec<Key> = injector.bindings().map(|b| b.key().clone()).collect();
        assert_eq!(
            keys,
            vec![
                Key::of::<usize>(),
                Key::of::<u64>(),
                Key::of::<u32>(),
                Key::of::<u16>()
            ]
        );
    }
}
