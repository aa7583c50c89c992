//! The contract an atomic-model author implements.
//!
//! A [`Dynamics`] is a local state machine driven by the DEVS protocol: it
//! declares how long it stays in its current state (`time_advance`), what it
//! emits when that duration elapses (`output`), and how its state reacts to
//! internal, external and confluent events. Every operation except
//! `time_advance` has a default, so trivial models stay short.

use std::fmt;

use thiserror::Error;

use crate::observation::ObservationEvent;
use crate::rng::SharedRng;
use crate::time::Time;
use crate::value::Value;

/// A failure raised by user model code during a transition.
///
/// The coordinator wraps it with the offending model's fully qualified
/// path and aborts the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct DynamicsError(pub String);

impl DynamicsError {
    /// Creates an error from any printable reason.
    pub fn new(reason: impl fmt::Display) -> Self {
        Self(reason.to_string())
    }
}

/// One external event delivered to a model's input port.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalEvent {
    /// The input port the event arrives on.
    pub port: String,
    /// The payload.
    pub value: Value,
}

impl ExternalEvent {
    /// Creates an event on `port` carrying `value`.
    pub fn new(port: impl Into<String>, value: Value) -> Self {
        Self {
            port: port.into(),
            value,
        }
    }
}

/// The unordered multiset of external events delivered to one model at one
/// instant.
pub type Bag = Vec<ExternalEvent>;

/// Collector handed to [`Dynamics::output`] and [`Dynamics::request`].
///
/// Events emitted here are tagged with the source simulator by the wrapper
/// and routed through the coupling graph.
#[derive(Debug, Default)]
pub struct OutputBag {
    events: Vec<ExternalEvent>,
}

impl OutputBag {
    /// Creates an empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `value` on the model's output port `port`.
    pub fn emit(&mut self, port: impl Into<String>, value: Value) {
        self.events.push(ExternalEvent::new(port, value));
    }

    /// Number of emitted events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// True when nothing was emitted.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Iterates the emitted events in emission order.
    pub fn iter(&self) -> impl Iterator<Item = &ExternalEvent> {
        self.events.iter()
    }

    /// Consumes the bag, yielding the emitted events.
    pub fn into_events(self) -> Vec<ExternalEvent> {
        self.events
    }
}

/// Construction context handed to a dynamics factory.
///
/// Carries the model's fully qualified path and the shared RNG handle, in
/// place of the global singletons a plug-in would otherwise reach for.
#[derive(Clone, Debug)]
pub struct DynamicsContext {
    /// Dot-separated path of the atomic model from the root.
    pub path: String,
    /// Handle on the simulation-wide generator.
    pub rng: SharedRng,
}

impl DynamicsContext {
    /// Creates a context for the model at `path`.
    pub fn new(path: impl Into<String>, rng: SharedRng) -> Self {
        Self {
            path: path.into(),
            rng,
        }
    }
}

/// The DEVS capability set implemented by an atomic model.
pub trait Dynamics: Send {
    /// Initializes the state and returns the first time-advance.
    ///
    /// Called once at simulation start. The default defers to
    /// [`time_advance`](Dynamics::time_advance).
    fn init(&mut self, time: Time) -> Result<Time, DynamicsError> {
        let _ = time;
        Ok(self.time_advance())
    }

    /// Computes the output function.
    ///
    /// Called when the model is imminent, before the transition fires.
    fn output(&mut self, time: Time, output: &mut OutputBag) -> Result<(), DynamicsError> {
        let _ = (time, output);
        Ok(())
    }

    /// Duration of the current state; [`Time::INFINITY`] means passive.
    fn time_advance(&self) -> Time;

    /// State change when the model is imminent and receives no input.
    fn internal_transition(&mut self, time: Time) -> Result<(), DynamicsError> {
        let _ = time;
        Ok(())
    }

    /// State change when input arrives while the model is not imminent.
    fn external_transition(&mut self, time: Time, bag: &Bag) -> Result<(), DynamicsError> {
        let _ = (time, bag);
        Ok(())
    }

    /// State change when the model is imminent and input arrives at the
    /// same instant.
    ///
    /// The default runs the internal transition, then the external one with
    /// the same bag.
    fn confluent_transition(&mut self, time: Time, bag: &Bag) -> Result<(), DynamicsError> {
        self.internal_transition(time)?;
        self.external_transition(time, bag)
    }

    /// Answers a synchronous query event from another model.
    fn request(
        &mut self,
        event: &ExternalEvent,
        time: Time,
        output: &mut OutputBag,
    ) -> Result<(), DynamicsError> {
        let _ = (event, time, output);
        Ok(())
    }

    /// Samples the model state for an observation view.
    fn observation(&self, event: &ObservationEvent) -> Value {
        let _ = event;
        Value::Null
    }

    /// Called once when the simulation ends.
    fn finish(&mut self) {}
}

/// A debug decorator that wraps any [`Dynamics`] and traces every call.
///
/// The wrapper owns the wrapped dynamics and is indistinguishable to the
/// simulator.
pub struct DynamicsDbg {
    inner: Box<dyn Dynamics>,
    path: String,
}

impl DynamicsDbg {
    /// Wraps `inner`, labelling trace events with the model `path`.
    pub fn new(path: impl Into<String>, inner: Box<dyn Dynamics>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }
}

impl Dynamics for DynamicsDbg {
    fn init(&mut self, time: Time) -> Result<Time, DynamicsError> {
        let ta = self.inner.init(time)?;
        tracing::debug!(model = %self.path, time = %time, ta = %ta, "init");
        Ok(ta)
    }

    fn output(&mut self, time: Time, output: &mut OutputBag) -> Result<(), DynamicsError> {
        self.inner.output(time, output)?;
        tracing::debug!(model = %self.path, time = %time, events = output.len(), "output");
        Ok(())
    }

    fn time_advance(&self) -> Time {
        let ta = self.inner.time_advance();
        tracing::debug!(model = %self.path, ta = %ta, "time_advance");
        ta
    }

    fn internal_transition(&mut self, time: Time) -> Result<(), DynamicsError> {
        tracing::debug!(model = %self.path, time = %time, "internal_transition");
        self.inner.internal_transition(time)
    }

    fn external_transition(&mut self, time: Time, bag: &Bag) -> Result<(), DynamicsError> {
        tracing::debug!(model = %self.path, time = %time, events = bag.len(), "external_transition");
        self.inner.external_transition(time, bag)
    }

    fn confluent_transition(&mut self, time: Time, bag: &Bag) -> Result<(), DynamicsError> {
        tracing::debug!(model = %self.path, time = %time, events = bag.len(), "confluent_transition");
        self.inner.confluent_transition(time, bag)
    }

    fn request(
        &mut self,
        event: &ExternalEvent,
        time: Time,
        output: &mut OutputBag,
    ) -> Result<(), DynamicsError> {
        tracing::debug!(model = %self.path, time = %time, port = %event.port, "request");
        self.inner.request(event, time, output)
    }

    fn observation(&self, event: &ObservationEvent) -> Value {
        self.inner.observation(event)
    }

    fn finish(&mut self) {
        tracing::debug!(model = %self.path, "finish");
        self.inner.finish();
    }
}
