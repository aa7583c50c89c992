//! The model graph: a tree of atomic and coupled models.
//!
//! The graph owns every model node in an arena; [`ModelId`] handles are
//! indices into it, so parent and peer back-references never own anything.
//! Each port carries the multiset of its peers — the same connection is
//! recorded on both endpoints (the mirror invariant), and every public
//! mutation either completes entirely or leaves the graph untouched.
//!
//! A coupled model records couplings on the inward-facing side of its own
//! ports: input couplings hang off the inward side of its input ports,
//! output couplings off the inward side of its output ports, and internal
//! couplings live directly on the children's port peer lists.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ModelId;

/// Errors raised by graph mutations and lookups.
///
/// All of them are fatal for a simulation: they indicate a malformed model
/// description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("model `{0}` not found")]
    UnknownModel(String),

    #[error("model `{model}` has no {direction} port `{port}`")]
    UnknownPort {
        model: String,
        port: String,
        direction: &'static str,
    },

    #[error("port `{port}` on model `{model}` is not an {expected} port")]
    PortDirection {
        model: String,
        port: String,
        expected: &'static str,
    },

    #[error("a model named `{name}` already exists under `{parent}`")]
    DuplicateName { name: String, parent: String },

    #[error("model `{0}` is not a coupled model")]
    NotCoupled(String),

    #[error("model `{child}` is not a child of `{parent}`")]
    NotChild { child: String, parent: String },

    #[error("no connection from `{origin}` to `{destination}`")]
    UnknownConnection { origin: String, destination: String },

    #[error("model `{model}` is connected outside the displaced set through port `{port}`")]
    DisplaceConflict { model: String, port: String },

    #[error("models `{a}` and `{b}` are not siblings")]
    NotSiblings { a: String, b: String },

    #[error("the root model `{0}` cannot be removed or moved")]
    Root(String),
}

/// The side of a model a port (or the inward face of a port) lives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Input,
    Output,
    InternalInput,
    InternalOutput,
}

impl Side {
    fn direction(self) -> &'static str {
        match self {
            Side::Input | Side::InternalInput => "input",
            Side::Output | Side::InternalOutput => "output",
        }
    }
}

/// A named port and the multiset of its peers.
///
/// Duplicate peers are preserved: several fan-out edges to the same
/// destination are semantically distinct deliveries.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Port {
    name: String,
    peers: Vec<(ModelId, String)>,
}

impl Port {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            peers: Vec::new(),
        }
    }

    /// The port name, unique within its side of the owning model.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The peers connected to this port, in insertion order.
    pub fn peers(&self) -> &[(ModelId, String)] {
        &self.peers
    }

    fn count(&self, peer: ModelId, peer_port: &str) -> usize {
        self.peers
            .iter()
            .filter(|(m, p)| *m == peer && p == peer_port)
            .count()
    }

    fn remove_one(&mut self, peer: ModelId, peer_port: &str) -> bool {
        if let Some(pos) = self
            .peers
            .iter()
            .position(|(m, p)| *m == peer && p == peer_port)
        {
            self.peers.remove(pos);
            true
        } else {
            false
        }
    }
}

/// Coupling state owned by a coupled model.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CoupledState {
    children: Vec<ModelId>,
    internal_input: Vec<Port>,
    internal_output: Vec<Port>,
}

/// The sealed sum of model kinds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ModelKind {
    /// A leaf model driven by user dynamics.
    Atomic,
    /// A container with children and coupling tables.
    Coupled(CoupledState),
    /// A foreign placeholder ignored by the scheduler and the router.
    Opaque,
}

/// One node of the model tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelNode {
    name: String,
    parent: Option<ModelId>,
    kind: ModelKind,
    input_ports: Vec<Port>,
    output_ports: Vec<Port>,
}

impl ModelNode {
    fn new(name: &str, parent: Option<ModelId>, kind: ModelKind) -> Self {
        Self {
            name: name.to_string(),
            parent,
            kind,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
        }
    }
}

/// The arena-owned model tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelGraph {
    nodes: Vec<Option<ModelNode>>,
    root: ModelId,
}

impl ModelGraph {
    /// Creates a graph whose root is an empty coupled model.
    pub fn new(root_name: &str) -> Self {
        let root = ModelNode::new(root_name, None, ModelKind::Coupled(CoupledState::default()));
        Self {
            nodes: vec![Some(root)],
            root: ModelId(0),
        }
    }

    /// The root coupled model.
    pub fn root(&self) -> ModelId {
        self.root
    }

    /// Number of live models in the tree.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    /// True when only the root remains.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    fn node(&self, id: ModelId) -> Result<&ModelNode, GraphError> {
        self.nodes
            .get(id.index())
            .and_then(|n| n.as_ref())
            .ok_or_else(|| GraphError::UnknownModel(format!("#{}", id.0)))
    }

    fn node_mut(&mut self, id: ModelId) -> Result<&mut ModelNode, GraphError> {
        self.nodes
            .get_mut(id.index())
            .and_then(|n| n.as_mut())
            .ok_or_else(|| GraphError::UnknownModel(format!("#{}", id.0)))
    }

    fn coupled(&self, id: ModelId) -> Result<&CoupledState, GraphError> {
        match &self.node(id)?.kind {
            ModelKind::Coupled(state) => Ok(state),
            _ => Err(GraphError::NotCoupled(self.display_name(id))),
        }
    }

    fn coupled_mut(&mut self, id: ModelId) -> Result<&mut CoupledState, GraphError> {
        let name = self.display_name(id);
        match &mut self.node_mut(id)?.kind {
            ModelKind::Coupled(state) => Ok(state),
            _ => Err(GraphError::NotCoupled(name)),
        }
    }

    fn display_name(&self, id: ModelId) -> String {
        self.node(id)
            .map(|n| n.name.clone())
            .unwrap_or_else(|_| format!("#{}", id.0))
    }

    /// The model's name, if it is alive.
    pub fn name(&self, id: ModelId) -> Option<&str> {
        self.node(id).ok().map(|n| n.name.as_str())
    }

    /// The containing coupled model, `None` for the root.
    pub fn parent(&self, id: ModelId) -> Option<ModelId> {
        self.node(id).ok().and_then(|n| n.parent)
    }

    /// The model's kind.
    pub fn kind(&self, id: ModelId) -> Option<&ModelKind> {
        self.node(id).ok().map(|n| &n.kind)
    }

    /// True for atomic models.
    pub fn is_atomic(&self, id: ModelId) -> bool {
        matches!(self.kind(id), Some(ModelKind::Atomic))
    }

    /// True for coupled models.
    pub fn is_coupled(&self, id: ModelId) -> bool {
        matches!(self.kind(id), Some(ModelKind::Coupled(_)))
    }

    /// True for opaque placeholders.
    pub fn is_opaque(&self, id: ModelId) -> bool {
        matches!(self.kind(id), Some(ModelKind::Opaque))
    }

    /// The children of a coupled model, in insertion order.
    pub fn children(&self, id: ModelId) -> &[ModelId] {
        match self.kind(id) {
            Some(ModelKind::Coupled(state)) => &state.children,
            _ => &[],
        }
    }

    /// Looks up a direct child by name.
    pub fn find_child(&self, parent: ModelId, name: &str) -> Option<ModelId> {
        self.children(parent)
            .iter()
            .copied()
            .find(|&c| self.name(c) == Some(name))
    }

    /// The fully qualified, dot-separated path from the root.
    pub fn full_path(&self, id: ModelId) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(m) = cursor {
            match self.node(m) {
                Ok(node) => {
                    parts.push(node.name.clone());
                    cursor = node.parent;
                }
                Err(_) => break,
            }
        }
        parts.reverse();
        parts.join(".")
    }

    /// Resolves a dot-separated path starting at the root.
    pub fn find_path(&self, path: &str) -> Option<ModelId> {
        let mut parts = path.split('.');
        let root_name = parts.next()?;
        if self.name(self.root) != Some(root_name) {
            return None;
        }
        let mut cursor = self.root;
        for part in parts {
            cursor = self.find_child(cursor, part)?;
        }
        Some(cursor)
    }

    /// All live model ids, root first, depth first.
    pub fn iter(&self) -> Vec<ModelId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            out.push(id);
            for &child in self.children(id).iter().rev() {
                stack.push(child);
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Model creation
    // ------------------------------------------------------------------

    fn add_model(
        &mut self,
        parent: ModelId,
        name: &str,
        kind: ModelKind,
    ) -> Result<ModelId, GraphError> {
        self.coupled(parent)?;
        if self.find_child(parent, name).is_some() {
            return Err(GraphError::DuplicateName {
                name: name.to_string(),
                parent: self.display_name(parent),
            });
        }

        let id = ModelId(self.nodes.len() as u32);
        self.nodes
            .push(Some(ModelNode::new(name, Some(parent), kind)));
        match self.coupled_mut(parent) {
            Ok(state) => state.children.push(id),
            Err(err) => {
                // Checked above, but never leave the allocated node dangling.
                self.nodes.pop();
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Adds an atomic child model.
    pub fn add_atomic(&mut self, parent: ModelId, name: &str) -> Result<ModelId, GraphError> {
        self.add_model(parent, name, ModelKind::Atomic)
    }

    /// Adds a coupled child model.
    pub fn add_coupled(&mut self, parent: ModelId, name: &str) -> Result<ModelId, GraphError> {
        self.add_model(parent, name, ModelKind::Coupled(CoupledState::default()))
    }

    /// Adds an opaque placeholder child.
    pub fn add_opaque(&mut self, parent: ModelId, name: &str) -> Result<ModelId, GraphError> {
        self.add_model(parent, name, ModelKind::Opaque)
    }

    // ------------------------------------------------------------------
    // Ports
    // ------------------------------------------------------------------

    /// Declares an input port. Idempotent when the port already exists.
    pub fn add_input_port(&mut self, model: ModelId, name: &str) -> Result<(), GraphError> {
        let node = self.node_mut(model)?;
        if node.input_ports.iter().any(|p| p.name == name) {
            return Ok(());
        }
        node.input_ports.push(Port::new(name));
        if let ModelKind::Coupled(state) = &mut node.kind {
            state.internal_input.push(Port::new(name));
        }
        Ok(())
    }

    /// Declares an output port. Idempotent when the port already exists.
    pub fn add_output_port(&mut self, model: ModelId, name: &str) -> Result<(), GraphError> {
        let node = self.node_mut(model)?;
        if node.output_ports.iter().any(|p| p.name == name) {
            return Ok(());
        }
        node.output_ports.push(Port::new(name));
        if let ModelKind::Coupled(state) = &mut node.kind {
            state.internal_output.push(Port::new(name));
        }
        Ok(())
    }

    /// True when `model` declares input port `name`.
    pub fn has_input_port(&self, model: ModelId, name: &str) -> bool {
        self.node(model)
            .map(|n| n.input_ports.iter().any(|p| p.name == name))
            .unwrap_or(false)
    }

    /// True when `model` declares output port `name`.
    pub fn has_output_port(&self, model: ModelId, name: &str) -> bool {
        self.node(model)
            .map(|n| n.output_ports.iter().any(|p| p.name == name))
            .unwrap_or(false)
    }

    /// The input ports of a model, in declaration order.
    pub fn input_ports(&self, model: ModelId) -> &[Port] {
        self.node(model).map(|n| &n.input_ports[..]).unwrap_or(&[])
    }

    /// The output ports of a model, in declaration order.
    pub fn output_ports(&self, model: ModelId) -> &[Port] {
        self.node(model).map(|n| &n.output_ports[..]).unwrap_or(&[])
    }

    /// The inward faces of a coupled model's input ports.
    pub fn internal_input_ports(&self, model: ModelId) -> &[Port] {
        match self.kind(model) {
            Some(ModelKind::Coupled(state)) => &state.internal_input,
            _ => &[],
        }
    }

    /// The inward faces of a coupled model's output ports.
    pub fn internal_output_ports(&self, model: ModelId) -> &[Port] {
        match self.kind(model) {
            Some(ModelKind::Coupled(state)) => &state.internal_output,
            _ => &[],
        }
    }

    /// Peers of an output port, in insertion order. Empty when unknown.
    pub fn output_peers(&self, model: ModelId, port: &str) -> &[(ModelId, String)] {
        self.output_ports(model)
            .iter()
            .find(|p| p.name == port)
            .map(|p| p.peers())
            .unwrap_or(&[])
    }

    /// Peers of an input port, in insertion order. Empty when unknown.
    pub fn input_peers(&self, model: ModelId, port: &str) -> &[(ModelId, String)] {
        self.input_ports(model)
            .iter()
            .find(|p| p.name == port)
            .map(|p| p.peers())
            .unwrap_or(&[])
    }

    /// Inward peers of a coupled model's input port (its input couplings).
    pub fn internal_input_peers(&self, model: ModelId, port: &str) -> &[(ModelId, String)] {
        self.internal_input_ports(model)
            .iter()
            .find(|p| p.name == port)
            .map(|p| p.peers())
            .unwrap_or(&[])
    }

    /// Inward peers of a coupled model's output port (its output couplings).
    pub fn internal_output_peers(&self, model: ModelId, port: &str) -> &[(ModelId, String)] {
        self.internal_output_ports(model)
            .iter()
            .find(|p| p.name == port)
            .map(|p| p.peers())
            .unwrap_or(&[])
    }

    fn ports(&self, model: ModelId, side: Side) -> Result<&[Port], GraphError> {
        let node = self.node(model)?;
        Ok(match side {
            Side::Input => &node.input_ports,
            Side::Output => &node.output_ports,
            Side::InternalInput | Side::InternalOutput => match &node.kind {
                ModelKind::Coupled(state) => {
                    if side == Side::InternalInput {
                        &state.internal_input
                    } else {
                        &state.internal_output
                    }
                }
                _ => return Err(GraphError::NotCoupled(node.name.clone())),
            },
        })
    }

    fn port(&self, model: ModelId, side: Side, name: &str) -> Result<&Port, GraphError> {
        self.ports(model, side)?
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| GraphError::UnknownPort {
                model: self.display_name(model),
                port: name.to_string(),
                direction: side.direction(),
            })
    }

    fn port_mut(&mut self, model: ModelId, side: Side, name: &str) -> Result<&mut Port, GraphError> {
        let display = self.display_name(model);
        let node = self.node_mut(model)?;
        let ports = match side {
            Side::Input => &mut node.input_ports,
            Side::Output => &mut node.output_ports,
            Side::InternalInput | Side::InternalOutput => match &mut node.kind {
                ModelKind::Coupled(state) => {
                    if side == Side::InternalInput {
                        &mut state.internal_input
                    } else {
                        &mut state.internal_output
                    }
                }
                _ => return Err(GraphError::NotCoupled(display)),
            },
        };
        ports
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or(GraphError::UnknownPort {
                model: display,
                port: name.to_string(),
                direction: side.direction(),
            })
    }

    // ------------------------------------------------------------------
    // Connection validation helpers
    // ------------------------------------------------------------------

    fn require_child(&self, parent: ModelId, child: ModelId) -> Result<(), GraphError> {
        if self.parent(child) == Some(parent) {
            Ok(())
        } else {
            Err(GraphError::NotChild {
                child: self.display_name(child),
                parent: self.display_name(parent),
            })
        }
    }

    /// Checks that `port` exists as an input port, distinguishing a missing
    /// port from one declared on the wrong side.
    fn require_input_port(&self, model: ModelId, port: &str) -> Result<(), GraphError> {
        if self.has_input_port(model, port) {
            Ok(())
        } else if self.has_output_port(model, port) {
            Err(GraphError::PortDirection {
                model: self.display_name(model),
                port: port.to_string(),
                expected: "input",
            })
        } else {
            Err(GraphError::UnknownPort {
                model: self.display_name(model),
                port: port.to_string(),
                direction: "input",
            })
        }
    }

    fn require_output_port(&self, model: ModelId, port: &str) -> Result<(), GraphError> {
        if self.has_output_port(model, port) {
            Ok(())
        } else if self.has_input_port(model, port) {
            Err(GraphError::PortDirection {
                model: self.display_name(model),
                port: port.to_string(),
                expected: "output",
            })
        } else {
            Err(GraphError::UnknownPort {
                model: self.display_name(model),
                port: port.to_string(),
                direction: "output",
            })
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Connects a coupled model's own input port to a child's input port.
    pub fn add_input_connection(
        &mut self,
        coupled: ModelId,
        src_port: &str,
        child: ModelId,
        child_port: &str,
    ) -> Result<(), GraphError> {
        self.coupled(coupled)?;
        self.require_child(coupled, child)?;
        self.require_input_port(coupled, src_port)?;
        self.require_input_port(child, child_port)?;

        self.port_mut(coupled, Side::InternalInput, src_port)?
            .peers
            .push((child, child_port.to_string()));
        self.port_mut(child, Side::Input, child_port)?
            .peers
            .push((coupled, src_port.to_string()));
        Ok(())
    }

    /// Connects a child's output port to the coupled model's own output port.
    pub fn add_output_connection(
        &mut self,
        coupled: ModelId,
        child: ModelId,
        child_port: &str,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        self.coupled(coupled)?;
        self.require_child(coupled, child)?;
        self.require_output_port(child, child_port)?;
        self.require_output_port(coupled, dst_port)?;

        self.port_mut(child, Side::Output, child_port)?
            .peers
            .push((coupled, dst_port.to_string()));
        self.port_mut(coupled, Side::InternalOutput, dst_port)?
            .peers
            .push((child, child_port.to_string()));
        Ok(())
    }

    /// Connects one child's output port to another child's input port.
    ///
    /// Self-loops (`src == dst`) are permitted.
    pub fn add_internal_connection(
        &mut self,
        coupled: ModelId,
        src: ModelId,
        src_port: &str,
        dst: ModelId,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        self.coupled(coupled)?;
        self.require_child(coupled, src)?;
        self.require_child(coupled, dst)?;
        self.require_output_port(src, src_port)?;
        self.require_input_port(dst, dst_port)?;

        self.port_mut(src, Side::Output, src_port)?
            .peers
            .push((dst, dst_port.to_string()));
        self.port_mut(dst, Side::Input, dst_port)?
            .peers
            .push((src, src_port.to_string()));
        Ok(())
    }

    /// True when the input coupling exists with both mirror edges.
    pub fn exist_input_connection(
        &self,
        coupled: ModelId,
        src_port: &str,
        child: ModelId,
        child_port: &str,
    ) -> bool {
        let fwd = self
            .port(coupled, Side::InternalInput, src_port)
            .map(|p| p.count(child, child_port))
            .unwrap_or(0);
        let bwd = self
            .port(child, Side::Input, child_port)
            .map(|p| p.count(coupled, src_port))
            .unwrap_or(0);
        fwd > 0 && bwd > 0
    }

    /// True when the output coupling exists with both mirror edges.
    pub fn exist_output_connection(
        &self,
        coupled: ModelId,
        child: ModelId,
        child_port: &str,
        dst_port: &str,
    ) -> bool {
        let fwd = self
            .port(child, Side::Output, child_port)
            .map(|p| p.count(coupled, dst_port))
            .unwrap_or(0);
        let bwd = self
            .port(coupled, Side::InternalOutput, dst_port)
            .map(|p| p.count(child, child_port))
            .unwrap_or(0);
        fwd > 0 && bwd > 0
    }

    /// True when the internal coupling exists with both mirror edges.
    pub fn exist_internal_connection(
        &self,
        src: ModelId,
        src_port: &str,
        dst: ModelId,
        dst_port: &str,
    ) -> bool {
        let fwd = self
            .port(src, Side::Output, src_port)
            .map(|p| p.count(dst, dst_port))
            .unwrap_or(0);
        let bwd = self
            .port(dst, Side::Input, dst_port)
            .map(|p| p.count(src, src_port))
            .unwrap_or(0);
        fwd > 0 && bwd > 0
    }

    /// Removes one instance of an input coupling, both mirror edges at once.
    pub fn remove_input_connection(
        &mut self,
        coupled: ModelId,
        src_port: &str,
        child: ModelId,
        child_port: &str,
    ) -> Result<(), GraphError> {
        if !self.exist_input_connection(coupled, src_port, child, child_port) {
            return Err(GraphError::UnknownConnection {
                origin: format!("{}:{}", self.display_name(coupled), src_port),
                destination: format!("{}:{}", self.display_name(child), child_port),
            });
        }
        self.port_mut(coupled, Side::InternalInput, src_port)?
            .remove_one(child, child_port);
        self.port_mut(child, Side::Input, child_port)?
            .remove_one(coupled, src_port);
        Ok(())
    }

    /// Removes one instance of an output coupling, both mirror edges at once.
    pub fn remove_output_connection(
        &mut self,
        coupled: ModelId,
        child: ModelId,
        child_port: &str,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        if !self.exist_output_connection(coupled, child, child_port, dst_port) {
            return Err(GraphError::UnknownConnection {
                origin: format!("{}:{}", self.display_name(child), child_port),
                destination: format!("{}:{}", self.display_name(coupled), dst_port),
            });
        }
        self.port_mut(child, Side::Output, child_port)?
            .remove_one(coupled, dst_port);
        self.port_mut(coupled, Side::InternalOutput, dst_port)?
            .remove_one(child, child_port);
        Ok(())
    }

    /// Removes one instance of an internal coupling, both mirror edges at once.
    pub fn remove_internal_connection(
        &mut self,
        src: ModelId,
        src_port: &str,
        dst: ModelId,
        dst_port: &str,
    ) -> Result<(), GraphError> {
        if !self.exist_internal_connection(src, src_port, dst, dst_port) {
            return Err(GraphError::UnknownConnection {
                origin: format!("{}:{}", self.display_name(src), src_port),
                destination: format!("{}:{}", self.display_name(dst), dst_port),
            });
        }
        self.port_mut(src, Side::Output, src_port)?
            .remove_one(dst, dst_port);
        self.port_mut(dst, Side::Input, dst_port)?
            .remove_one(src, src_port);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Model removal, replacement, displacement
    // ------------------------------------------------------------------

    /// Removes the mirror edge of an incident connection of `model`.
    ///
    /// `side` is the side of `model` the edge hangs off; the mirror lives
    /// either on the parent's internal face or on a sibling/child port.
    fn unlink_mirror(&mut self, model: ModelId, side: Side, port: &str, peer: ModelId, peer_port: &str) {
        let parent = self.parent(model);
        let mirror_side = if Some(peer) == parent {
            match side {
                Side::Input => Side::InternalInput,
                Side::Output => Side::InternalOutput,
                // Internal faces only peer with children, never the parent.
                other => other,
            }
        } else {
            match side {
                // Mirror of an in-edge is on the peer's output side and
                // vice versa; internal faces mirror on the child's own port.
                Side::Input => Side::Output,
                Side::Output => Side::Input,
                Side::InternalInput => Side::Input,
                Side::InternalOutput => Side::Output,
            }
        };
        if let Ok(p) = self.port_mut(peer, mirror_side, peer_port) {
            p.remove_one(model, port);
        }
    }

    /// Detaches every connection incident to `model`.
    fn strip_connections(&mut self, model: ModelId) -> Result<(), GraphError> {
        let sides = [
            Side::Input,
            Side::Output,
            Side::InternalInput,
            Side::InternalOutput,
        ];
        for side in sides {
            let Ok(ports) = self.ports(model, side) else {
                continue;
            };
            let drained: Vec<(String, Vec<(ModelId, String)>)> = ports
                .iter()
                .map(|p| (p.name.clone(), p.peers.clone()))
                .collect();
            for (port, peers) in &drained {
                for (peer, peer_port) in peers {
                    self.unlink_mirror(model, side, port, *peer, peer_port);
                }
            }
            // Clear this side after the mirrors are gone.
            if let Ok(node) = self.node_mut(model) {
                let list = match side {
                    Side::Input => Some(&mut node.input_ports),
                    Side::Output => Some(&mut node.output_ports),
                    Side::InternalInput | Side::InternalOutput => match &mut node.kind {
                        ModelKind::Coupled(state) => Some(if side == Side::InternalInput {
                            &mut state.internal_input
                        } else {
                            &mut state.internal_output
                        }),
                        _ => None,
                    },
                };
                if let Some(list) = list {
                    for p in list.iter_mut() {
                        p.peers.clear();
                    }
                }
            }
        }
        Ok(())
    }

    fn collect_subtree(&self, id: ModelId, out: &mut Vec<ModelId>) {
        // Post-order: children land before their parent.
        for child in self.children(id).to_vec() {
            self.collect_subtree(child, out);
        }
        out.push(id);
    }

    /// Removes a model and its whole subtree.
    ///
    /// Connections are detached first, then models are destroyed bottom-up.
    pub fn remove_model(&mut self, id: ModelId) -> Result<(), GraphError> {
        if id == self.root {
            return Err(GraphError::Root(self.display_name(id)));
        }
        let parent = self
            .parent(id)
            .ok_or_else(|| GraphError::UnknownModel(format!("#{}", id.0)))?;

        let mut doomed = Vec::new();
        self.collect_subtree(id, &mut doomed);
        for m in doomed {
            self.strip_connections(m)?;
            self.nodes[m.index()] = None;
        }
        if let Ok(state) = self.coupled_mut(parent) {
            state.children.retain(|&c| c != id);
        }
        Ok(())
    }

    /// Rewires every incident connection from `old` onto `new`, merging the
    /// port lists, then deletes `old`.
    ///
    /// Both models must be siblings under the same coupled model.
    pub fn replace(&mut self, old: ModelId, new: ModelId) -> Result<(), GraphError> {
        if old == self.root {
            return Err(GraphError::Root(self.display_name(old)));
        }
        let (old_parent, new_parent) = (self.parent(old), self.parent(new));
        if old_parent.is_none() || old_parent != new_parent || old == new {
            return Err(GraphError::NotSiblings {
                a: self.display_name(old),
                b: self.display_name(new),
            });
        }

        for side in [Side::Input, Side::Output] {
            let drained: Vec<(String, Vec<(ModelId, String)>)> = self
                .ports(old, side)?
                .iter()
                .map(|p| (p.name.clone(), p.peers.clone()))
                .collect();
            for (port, peers) in drained {
                match side {
                    Side::Input => self.add_input_port(new, &port)?,
                    _ => self.add_output_port(new, &port)?,
                }
                for (peer, peer_port) in &peers {
                    self.rewrite_mirror(old, side, &port, *peer, peer_port, new);
                }
                self.port_mut(new, side, &port)?.peers.extend(peers);
                self.port_mut(old, side, &port)?.peers.clear();
            }
        }
        self.remove_model(old)
    }

    /// Points one mirror entry `(old, port)` at `new` instead, preserving
    /// multiset counts and insertion order.
    fn rewrite_mirror(
        &mut self,
        old: ModelId,
        side: Side,
        port: &str,
        peer: ModelId,
        peer_port: &str,
        new: ModelId,
    ) {
        let parent = self.parent(old);
        let mirror_side = if Some(peer) == parent {
            match side {
                Side::Input => Side::InternalInput,
                _ => Side::InternalOutput,
            }
        } else {
            match side {
                Side::Input => Side::Output,
                _ => Side::Input,
            }
        };
        if let Ok(p) = self.port_mut(peer, mirror_side, peer_port) {
            if let Some(entry) = p
                .peers
                .iter_mut()
                .find(|(m, q)| *m == old && q == port)
            {
                entry.0 = new;
            }
        }
    }

    /// Moves a set of sibling children into another coupled model.
    ///
    /// Fails when any moved model keeps a connection to an endpoint outside
    /// the moved set (including couplings through the old parent's ports).
    /// Connections among the moved models survive untouched.
    pub fn displace(
        &mut self,
        children: &[ModelId],
        destination: ModelId,
    ) -> Result<(), GraphError> {
        let Some(&first) = children.first() else {
            return Ok(());
        };
        let parent = self
            .parent(first)
            .ok_or_else(|| GraphError::Root(self.display_name(first)))?;
        self.coupled(destination)?;

        for &m in children {
            if self.parent(m) != Some(parent) {
                return Err(GraphError::NotChild {
                    child: self.display_name(m),
                    parent: self.display_name(parent),
                });
            }
            if m == destination {
                return Err(GraphError::DisplaceConflict {
                    model: self.display_name(m),
                    port: String::new(),
                });
            }
        }

        // Reject any edge that leaves the moved set.
        for &m in children {
            for side in [Side::Input, Side::Output] {
                for port in self.ports(m, side)? {
                    for (peer, _) in port.peers() {
                        if !children.contains(peer) {
                            return Err(GraphError::DisplaceConflict {
                                model: self.display_name(m),
                                port: port.name().to_string(),
                            });
                        }
                    }
                }
            }
            let name = self.display_name(m);
            if self.find_child(destination, &name).is_some() {
                return Err(GraphError::DuplicateName {
                    name,
                    parent: self.display_name(destination),
                });
            }
        }

        // Move in the original sibling order; peer ids stay valid so the
        // intra-set connections need no rewiring.
        let moved: Vec<ModelId> = self
            .children(parent)
            .iter()
            .copied()
            .filter(|c| children.contains(c))
            .collect();
        self.coupled_mut(parent)?
            .children
            .retain(|c| !children.contains(c));
        for &m in &moved {
            self.coupled_mut(destination)?.children.push(m);
            self.node_mut(m)?.parent = Some(destination);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Consistency audit (used by tests and debug builds)
    // ------------------------------------------------------------------

    /// Verifies the mirror and parent invariants over the whole tree.
    ///
    /// Returns a description of the first violation found, if any.
    pub fn audit(&self) -> Option<String> {
        for id in self.iter() {
            for child in self.children(id) {
                if self.parent(*child) != Some(id) {
                    return Some(format!(
                        "child `{}` of `{}` has a stale parent pointer",
                        self.display_name(*child),
                        self.display_name(id)
                    ));
                }
            }
            let mut names: Vec<&str> =
                self.children(id).iter().filter_map(|&c| self.name(c)).collect();
            names.sort_unstable();
            if names.windows(2).any(|w| w[0] == w[1]) {
                return Some(format!("duplicate sibling under `{}`", self.display_name(id)));
            }

            for side in [
                Side::Input,
                Side::Output,
                Side::InternalInput,
                Side::InternalOutput,
            ] {
                let Ok(ports) = self.ports(id, side) else {
                    continue;
                };
                for port in ports {
                    for (peer, peer_port) in port.peers() {
                        let count = port.count(*peer, peer_port);
                        let mirror = self.mirror_count(id, side, port.name(), *peer, peer_port);
                        if mirror != count {
                            return Some(format!(
                                "mirror mismatch on `{}:{}` -> `{}:{}` ({count} vs {mirror})",
                                self.display_name(id),
                                port.name(),
                                self.display_name(*peer),
                                peer_port,
                            ));
                        }
                    }
                }
            }
        }
        None
    }

    fn mirror_count(
        &self,
        model: ModelId,
        side: Side,
        port: &str,
        peer: ModelId,
        peer_port: &str,
    ) -> usize {
        let parent = self.parent(model);
        let mirror_side = if Some(peer) == parent {
            match side {
                Side::Input => Side::InternalInput,
                Side::Output => Side::InternalOutput,
                other => other,
            }
        } else if Some(model) == self.parent(peer)
            && matches!(side, Side::InternalInput | Side::InternalOutput)
        {
            match side {
                Side::InternalInput => Side::Input,
                _ => Side::Output,
            }
        } else {
            match side {
                Side::Input => Side::Output,
                Side::Output => Side::Input,
                Side::InternalInput => Side::Input,
                Side::InternalOutput => Side::Output,
            }
        };
        self.port(peer, mirror_side, peer_port)
            .map(|p| p.count(model, port))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_atoms() -> (ModelGraph, ModelId, ModelId) {
        let mut g = ModelGraph::new("top");
        let a = g.add_atomic(g.root(), "a").unwrap();
        let b = g.add_atomic(g.root(), "b").unwrap();
        g.add_output_port(a, "out").unwrap();
        g.add_input_port(b, "in").unwrap();
        (g, a, b)
    }

    #[test]
    fn test_children_and_names() {
        let (g, a, b) = two_atoms();
        assert_eq!(g.children(g.root()), &[a, b]);
        assert_eq!(g.find_child(g.root(), "b"), Some(b));
        assert_eq!(g.full_path(a), "top.a");
        assert_eq!(g.find_path("top.a"), Some(a));
        assert_eq!(g.find_path("top.zzz"), None);
    }

    #[test]
    fn test_duplicate_sibling_rejected() {
        let (mut g, _, _) = two_atoms();
        let err = g.add_atomic(g.root(), "a").unwrap_err();
        assert!(matches!(err, GraphError::DuplicateName { .. }));
    }

    #[test]
    fn test_port_idempotence() {
        let (mut g, a, _) = two_atoms();
        g.add_output_port(a, "out").unwrap();
        assert_eq!(g.output_ports(a).len(), 1);
    }

    #[test]
    fn test_internal_connection_mirrors() {
        let (mut g, a, b) = two_atoms();
        g.add_internal_connection(g.root(), a, "out", b, "in").unwrap();
        assert!(g.exist_internal_connection(a, "out", b, "in"));
        assert_eq!(g.output_peers(a, "out"), &[(b, "in".to_string())]);
        assert_eq!(g.input_peers(b, "in"), &[(a, "out".to_string())]);
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_fan_out_duplicates_preserved() {
        let (mut g, a, b) = two_atoms();
        let root = g.root();
        g.add_internal_connection(root, a, "out", b, "in").unwrap();
        g.add_internal_connection(root, a, "out", b, "in").unwrap();
        assert_eq!(g.output_peers(a, "out").len(), 2);
        assert_eq!(g.audit(), None);

        g.remove_internal_connection(a, "out", b, "in").unwrap();
        assert_eq!(g.output_peers(a, "out").len(), 1);
        assert!(g.exist_internal_connection(a, "out", b, "in"));
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_direction_mismatch_rolls_back() {
        let (mut g, a, b) = two_atoms();
        let root = g.root();
        g.add_output_port(b, "spare").unwrap();

        // Output port wired to an output port must fail without mutating.
        let err = g
            .add_internal_connection(root, a, "out", b, "spare")
            .unwrap_err();
        assert!(matches!(err, GraphError::PortDirection { .. }));
        assert!(g.output_peers(a, "out").is_empty());
        assert!(g.output_peers(b, "spare").is_empty());
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_input_output_couplings() {
        let mut g = ModelGraph::new("top");
        let p = g.add_coupled(g.root(), "p").unwrap();
        let a = g.add_atomic(p, "a").unwrap();
        g.add_input_port(p, "in").unwrap();
        g.add_output_port(p, "out").unwrap();
        g.add_input_port(a, "in").unwrap();
        g.add_output_port(a, "out").unwrap();

        g.add_input_connection(p, "in", a, "in").unwrap();
        g.add_output_connection(p, a, "out", "out").unwrap();

        assert!(g.exist_input_connection(p, "in", a, "in"));
        assert!(g.exist_output_connection(p, a, "out", "out"));
        assert_eq!(g.internal_input_peers(p, "in"), &[(a, "in".to_string())]);
        assert_eq!(g.internal_output_peers(p, "out"), &[(a, "out".to_string())]);
        assert_eq!(g.audit(), None);

        g.remove_input_connection(p, "in", a, "in").unwrap();
        assert!(!g.exist_input_connection(p, "in", a, "in"));
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_remove_model_strips_connections() {
        let (mut g, a, b) = two_atoms();
        let root = g.root();
        g.add_internal_connection(root, a, "out", b, "in").unwrap();
        g.remove_model(b).unwrap();

        assert!(g.name(b).is_none());
        assert!(g.output_peers(a, "out").is_empty());
        assert_eq!(g.children(root), &[a]);
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_remove_subtree_bottom_up() {
        let mut g = ModelGraph::new("top");
        let p = g.add_coupled(g.root(), "p").unwrap();
        let a = g.add_atomic(p, "a").unwrap();
        let q = g.add_coupled(p, "q").unwrap();
        let b = g.add_atomic(q, "b").unwrap();
        for (m, port) in [(a, "out"), (b, "out")] {
            g.add_output_port(m, port).unwrap();
        }
        g.add_input_port(q, "in").unwrap();
        g.add_input_port(b, "in").unwrap();
        g.add_internal_connection(p, a, "out", q, "in").unwrap();
        g.add_input_connection(q, "in", b, "in").unwrap();

        g.remove_model(q).unwrap();
        assert!(g.name(q).is_none());
        assert!(g.name(b).is_none());
        assert!(g.output_peers(a, "out").is_empty());
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_replace_rewires_connections() {
        let (mut g, a, b) = two_atoms();
        let root = g.root();
        g.add_internal_connection(root, a, "out", b, "in").unwrap();

        let c = g.add_atomic(root, "c").unwrap();
        g.replace(b, c).unwrap();

        assert!(g.name(b).is_none());
        assert!(g.has_input_port(c, "in"));
        assert_eq!(g.output_peers(a, "out"), &[(c, "in".to_string())]);
        assert!(g.exist_internal_connection(a, "out", c, "in"));
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_displace_moves_connected_pair() {
        let (mut g, a, b) = two_atoms();
        let root = g.root();
        g.add_internal_connection(root, a, "out", b, "in").unwrap();
        let dest = g.add_coupled(root, "dest").unwrap();

        g.displace(&[a, b], dest).unwrap();
        assert_eq!(g.parent(a), Some(dest));
        assert_eq!(g.parent(b), Some(dest));
        assert_eq!(g.children(dest), &[a, b]);
        assert!(g.exist_internal_connection(a, "out", b, "in"));
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_displace_rejects_external_edge() {
        let (mut g, a, b) = two_atoms();
        let root = g.root();
        g.add_internal_connection(root, a, "out", b, "in").unwrap();
        let dest = g.add_coupled(root, "dest").unwrap();

        // Moving only `a` leaves its edge to `b` dangling outside the set.
        let err = g.displace(&[a], dest).unwrap_err();
        assert!(matches!(err, GraphError::DisplaceConflict { .. }));
        assert_eq!(g.parent(a), Some(root));
        assert_eq!(g.audit(), None);
    }

    #[test]
    fn test_root_cannot_be_removed() {
        let mut g = ModelGraph::new("top");
        let root = g.root();
        assert!(matches!(g.remove_model(root), Err(GraphError::Root(_))));
    }
}
