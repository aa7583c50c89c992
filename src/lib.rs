//! # Veld Simulation Engine
//!
//! A hierarchical discrete-event simulation engine based on the DEVS
//! (Discrete EVent System) formalism.
//!
//! ## Design Principles
//!
//! - **Hierarchical composition**: Models form a tree of atomic leaves and
//!   coupled containers; coupled models carry three kinds of coupling tables
//!   (input, output, internal) that route events through the hierarchy.
//! - **Abstract simulator**: A single-threaded coordinator drives the DEVS
//!   protocol — collect outputs from the imminent set, route them through the
//!   coupling graph, then fire internal, external or confluent transitions.
//! - **Observation**: Views sample atomic models on a configurable schedule
//!   and stream framed trames to in-process plugins or a remote daemon.
//!
//! ## Typical flow
//!
//! A [`project::Project`] description and a [`registry::DynamicsRegistry`]
//! are handed to a [`root::RootCoordinator`], which builds the model tree,
//! wraps every atomic model in a [`simulator::Simulator`], and advances
//! simulated [`time::Time`] until the configured duration is reached.

pub mod coordinator;
pub mod dynamics;
pub mod graph;
pub mod observation;
pub mod project;
pub mod queue;
pub mod registry;
pub mod rng;
pub mod root;
pub mod router;
pub mod simulator;
pub mod time;
pub mod types;
pub mod value;
pub mod xml;

// Re-export commonly used types
pub use coordinator::{Coordinator, SimulationError, StepOutcome};
pub use dynamics::{Bag, Dynamics, DynamicsContext, DynamicsError, ExternalEvent, OutputBag};
pub use graph::{GraphError, ModelGraph, ModelKind};
pub use observation::{ObservationEvent, View, ViewPolicy};
pub use project::Project;
pub use registry::DynamicsRegistry;
pub use root::RootCoordinator;
pub use time::Time;
pub use types::{ModelId, SimulatorId};
pub use value::Value;
