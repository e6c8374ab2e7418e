//! Turns a [`DescriptorSet`] into a validated binding graph.
//!
//! Build order:
//!
//! 1. partition descriptors into plain declarations (by key) and
//!    multibinding contributions (by collection key), keeping registration
//!    order;
//! 2. reject keys declared more than once, and collection keys that also
//!    have a plain declaration;
//! 3. allocate one node per plain key, one per contribution and one per
//!    collection key, then link every edge to a node, failing on keys nobody
//!    declared;
//! 4. walk the eager edges depth-first, rejecting cycles and recording each
//!    node's provenance on the way back up.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::Arc,
};

use crate::{
    descriptor::{Declaration, Descriptor, DescriptorSet, Factory, Multibinding, Scope},
    error::{InjectError, Result},
    injector::SingletonSlot,
    key::Key,
    multibinding::{self, CollectionKind, MultibindingSet},
};

pub(crate) type NodeId = usize;

pub(crate) enum NodeKind {
    Provider {
        factory: Factory,
        dependencies: Vec<Edge>,
    },
    Alias {
        source: NodeId,
    },
    Collection {
        kind: CollectionKind,
        contributions: Vec<(Option<Arc<str>>, NodeId)>,
    },
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Edge {
    pub(crate) node: NodeId,
    pub(crate) lazy: bool,
}

pub(crate) struct BindingNode {
    pub(crate) key: Key,
    pub(crate) kind: NodeKind,
    pub(crate) scope: Scope,
    pub(crate) declaration: Option<Declaration>,
    pub(crate) provenance: Vec<Declaration>,
    pub(crate) slot: Option<SingletonSlot>,
}

impl BindingNode {
    fn new(key: Key, kind: NodeKind, scope: Scope, declaration: Option<Declaration>) -> Self {
        let slot = match scope {
            Scope::Singleton => Some(SingletonSlot::default()),
            Scope::Unscoped => None,
        };
        Self {
            key,
            kind,
            scope,
            declaration,
            provenance: Vec::new(),
            slot,
        }
    }

    /// Edges in evaluation order.
    pub(crate) fn edges(&self) -> Vec<Edge> {
        match &self.kind {
            NodeKind::Provider { dependencies, .. } => dependencies.clone(),
            NodeKind::Alias { source } => vec![Edge {
                node: *source,
                lazy: false,
            }],
            NodeKind::Collection { contributions, .. } => contributions
                .iter()
                .map(|(_, node)| Edge {
                    node: *node,
                    lazy: false,
                })
                .collect(),
        }
    }
}

/// The immutable topology produced by [`GraphBuilder`]. Only singleton slots
/// change after construction.
pub(crate) struct Graph {
    pub(crate) nodes: Vec<BindingNode>,
    pub(crate) index: HashMap<Key, NodeId>,
}

impl Graph {
    pub(crate) fn node(&self, id: NodeId) -> &BindingNode {
        &self.nodes[id]
    }

    pub(crate) fn lookup(&self, key: &Key) -> Option<NodeId> {
        self.index.get(key).copied()
    }
}

pub(crate) struct GraphBuilder<'d> {
    descriptors: &'d DescriptorSet,
}

impl<'d> GraphBuilder<'d> {
    pub(crate) fn new(descriptors: &'d DescriptorSet) -> Self {
        Self { descriptors }
    }

    pub(crate) fn build(self) -> Result<Graph> {
        let (plain, collections) = self.partition()?;

        let mut nodes: Vec<Option<BindingNode>> = Vec::new();
        let mut index: HashMap<Key, NodeId> = HashMap::new();
        for descriptor in &plain {
            index.insert(descriptor.key().clone(), nodes.len());
            nodes.push(None);
        }
        let mut contribution_ids: Vec<Vec<NodeId>> = Vec::with_capacity(collections.len());
        for set in &collections {
            let ids = (0..set.contributions().len())
                .map(|offset| nodes.len() + offset)
                .collect::<Vec<NodeId>>();
            nodes.extend(ids.iter().map(|_| None));
            contribution_ids.push(ids);
        }
        for set in &collections {
            index.insert(set.key().clone(), nodes.len());
            nodes.push(None);
        }

        let link = |key: &Key, requested_by: &Declaration| -> Result<NodeId> {
            index
                .get(key)
                .copied()
                .ok_or_else(|| InjectError::UnresolvedDependency {
                    key: key.clone(),
                    requested_by: requested_by.clone(),
                })
        };

        for descriptor in &plain {
            let id = index[descriptor.key()];
            nodes[id] = Some(link_descriptor(descriptor, &link)?);
        }
        for (set, ids) in collections.iter().zip(&contribution_ids) {
            let mut contributions = Vec::with_capacity(ids.len());
            for (&descriptor, &id) in set.contributions().iter().zip(ids) {
                nodes[id] = Some(link_descriptor(descriptor, &link)?);
                contributions.push((multibinding::map_key(descriptor), id));
            }
            let id = index[set.key()];
            nodes[id] = Some(BindingNode::new(
                set.key().clone(),
                NodeKind::Collection {
                    kind: set.kind(),
                    contributions,
                },
                Scope::Unscoped,
                None,
            ));
        }

        let nodes: Vec<BindingNode> = nodes.into_iter().flatten().collect();
        let mut graph = Graph { nodes, index };
        check_acyclic(&mut graph)?;
        tracing::debug!(
            "binding graph built: {} node(s), {} key(s), {} multibinding(s)",
            graph.nodes.len(),
            graph.index.len(),
            collections.len()
        );
        Ok(graph)
    }

    fn partition(&self) -> Result<(Vec<&'d Descriptor>, Vec<MultibindingSet<'d>>)> {
        let mut plain: Vec<&'d Descriptor> = Vec::new();
        let mut plain_index: HashMap<&'d Key, usize> = HashMap::new();
        let mut collections: Vec<MultibindingSet<'d>> = Vec::new();
        let mut collection_index: HashMap<Key, usize> = HashMap::new();

        let descriptors: &'d DescriptorSet = self.descriptors;
        for descriptor in descriptors.iter() {
            match descriptor.collection_key() {
                None => match plain_index.entry(descriptor.key()) {
                    Entry::Occupied(entry) => {
                        return Err(InjectError::DuplicateBinding {
                            key: descriptor.key().clone(),
                            first: plain[*entry.get()].declaration().clone(),
                            second: descriptor.declaration().clone(),
                        });
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(plain.len());
                        plain.push(descriptor);
                    }
                },
                Some(key) => {
                    let slot = *collection_index.entry(key.clone()).or_insert_with(|| {
                        let kind = match descriptor.multibinding() {
                            Multibinding::IntoMap(_) => CollectionKind::Map,
                            _ => CollectionKind::Set,
                        };
                        collections.push(MultibindingSet::new(key, kind));
                        collections.len() - 1
                    });
                    collections[slot].push(descriptor);
                }
            }
        }

        for set in &collections {
            if let Some(&at) = plain_index.get(set.key()) {
                return Err(InjectError::DuplicateBinding {
                    key: set.key().clone(),
                    first: plain[at].declaration().clone(),
                    second: set.contributions()[0].declaration().clone(),
                });
            }
            set.validate()?;
        }
        Ok((plain, collections))
    }
}

fn link_descriptor<F>(descriptor: &Descriptor, link: &F) -> Result<BindingNode>
where
    F: Fn(&Key, &Declaration) -> Result<NodeId>,
{
    let declaration = descriptor.declaration();
    let kind = match descriptor {
        Descriptor::Provider(provider) => {
            let mut dependencies = Vec::with_capacity(provider.dependencies.len());
            for dependency in &provider.dependencies {
                dependencies.push(Edge {
                    node: link(dependency.key(), declaration)?,
                    lazy: dependency.is_lazy(),
                });
            }
            NodeKind::Provider {
                factory: provider.factory.clone(),
                dependencies,
            }
        }
        Descriptor::Binding(binding) => NodeKind::Alias {
            source: link(&binding.source, declaration)?,
        },
    };
    Ok(BindingNode::new(
        descriptor.key().clone(),
        kind,
        descriptor.scope(),
        Some(declaration.clone()),
    ))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Active,
    Done,
}

/// Depth-first over eager edges. A node reached again while still on the
/// active path closes a cycle. Provenance is filled in post-order, so every
/// source's trail exists before its dependents need it.
fn check_acyclic(graph: &mut Graph) -> Result<()> {
    let mut marks = vec![Mark::Unvisited; graph.nodes.len()];
    let mut path: Vec<NodeId> = Vec::new();

    for root in 0..graph.nodes.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        // (node, index of the next edge to follow)
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        marks[root] = Mark::Active;
        path.push(root);

        while let Some(frame) = stack.last_mut() {
            let id = frame.0;
            let edges = graph.nodes[id].edges();
            let pending = edges[frame.1..]
                .iter()
                .position(|edge| !edge.lazy)
                .map(|offset| frame.1 + offset);
            match pending {
                Some(at) => {
                    frame.1 = at + 1;
                    let edge = edges[at];
                    match marks[edge.node] {
                        Mark::Done => {}
                        Mark::Active => {
                            let start = path
                                .iter()
                                .position(|&on_path| on_path == edge.node)
                                .unwrap_or(0);
                            let mut keys: Vec<Key> = path[start..]
                                .iter()
                                .map(|&on_path| graph.nodes[on_path].key.clone())
                                .collect();
                            keys.push(graph.nodes[edge.node].key.clone());
                            return Err(InjectError::CyclicBinding { path: keys });
                        }
                        Mark::Unvisited => {
                            marks[edge.node] = Mark::Active;
                            path.push(edge.node);
                            stack.push((edge.node, 0));
                        }
                    }
                }
                None => {
                    let provenance = provenance_of(graph, id);
                    graph.nodes[id].provenance = provenance;
                    marks[id] = Mark::Done;
                    path.pop();
                    stack.pop();
                }
            }
        }
    }
    Ok(())
}

fn provenance_of(graph: &Graph, id: NodeId) -> Vec<Declaration> {
    let node = &graph.nodes[id];
    let mut trail: Vec<Declaration> = node.declaration.iter().cloned().collect();
    match &node.kind {
        NodeKind::Provider { .. } => {}
        NodeKind::Alias { source } => {
            trail.extend(graph.nodes[*source].provenance.iter().cloned());
        }
        NodeKind::Collection { contributions, .. } => {
            for (_, contribution) in contributions {
                trail.extend(graph.nodes[*contribution].provenance.iter().cloned());
            }
        }
    }
    trail
}
