//! Event routing through the coupling graph.
//!
//! Given an output event on an atomic model's port, the router enumerates
//! every atomic destination by walking the mirror edges recorded on the
//! ports: an internal coupling hands the event to a sibling, an output
//! coupling lifts it through the enclosing coupled model, and an input
//! coupling pushes it down into a coupled destination. Enumeration order is
//! the insertion order of the coupling lists, so routing is deterministic.

use crate::graph::ModelGraph;
use crate::types::ModelId;

/// A resolved destination: an atomic model and one of its input ports.
pub type Destination = (ModelId, String);

/// Resolves the destinations of an output event on `(source, port)`.
///
/// Deliveries to atomic models are terminal, so self-loops cannot recurse.
/// Events that match no coupling are dropped: closure under coupling makes
/// the empty result well-defined.
pub fn route(graph: &ModelGraph, source: ModelId, port: &str) -> Vec<Destination> {
    let mut destinations = Vec::new();
    fan_out(graph, source, port, &mut destinations);
    destinations
}

/// Follows the outbound peers of `(model, port)`, one level of hierarchy at
/// a time.
fn fan_out(graph: &ModelGraph, model: ModelId, port: &str, destinations: &mut Vec<Destination>) {
    let parent = graph.parent(model);
    for (peer, peer_port) in graph.output_peers(model, port) {
        if Some(*peer) == parent {
            // Output coupling: the event leaves through the parent's own
            // output port and is routed again at the enclosing level.
            fan_out(graph, *peer, peer_port, destinations);
        } else {
            deliver(graph, *peer, peer_port, destinations);
        }
    }
}

/// Delivers an event arriving on `(model, port)` as an input.
fn deliver(graph: &ModelGraph, model: ModelId, port: &str, destinations: &mut Vec<Destination>) {
    if graph.is_atomic(model) {
        destinations.push((model, port.to_string()));
        return;
    }
    if graph.is_coupled(model) {
        for (child, child_port) in graph.internal_input_peers(model, port) {
            deliver(graph, *child, child_port, destinations);
        }
        return;
    }
    // Opaque placeholder: the scheduler ignores it, so the event is dropped.
    tracing::debug!(
        model = %graph.full_path(model),
        port,
        "dropping event delivered to an opaque model"
    );
}
