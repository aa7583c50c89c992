//! The per-atomic-model runtime wrapper.
//!
//! A [`Simulator`] pairs one atomic model's [`Dynamics`] with its scheduling
//! state: the last transition time `tl`, the next event time `tn`, and the
//! bag of pending external events routed to it during the current step.

use crate::dynamics::{Bag, Dynamics, DynamicsError, ExternalEvent, OutputBag};
use crate::observation::ObservationEvent;
use crate::time::Time;
use crate::types::ModelId;
use crate::value::Value;

/// An event emitted by an atomic model, tagged with its source.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputEvent {
    /// The emitting model.
    pub source: ModelId,
    /// The source output port.
    pub port: String,
    /// The payload.
    pub value: Value,
}

/// Runtime state of one atomic model.
pub struct Simulator {
    model: ModelId,
    path: String,
    dynamics: Box<dyn Dynamics>,
    tl: Time,
    tn: Time,
    bag: Bag,
}

impl Simulator {
    /// Wraps `dynamics` for the atomic model `model` at `path`.
    pub fn new(model: ModelId, path: impl Into<String>, dynamics: Box<dyn Dynamics>) -> Self {
        Self {
            model,
            path: path.into(),
            dynamics,
            tl: Time::ZERO,
            tn: Time::INFINITY,
            bag: Bag::new(),
        }
    }

    /// The wrapped atomic model.
    pub fn model(&self) -> ModelId {
        self.model
    }

    /// The model's fully qualified path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Time of the last transition.
    pub fn tl(&self) -> Time {
        self.tl
    }

    /// Time of the next internal event; infinity when passive.
    pub fn tn(&self) -> Time {
        self.tn
    }

    /// True when external events are pending for this step.
    pub fn has_pending(&self) -> bool {
        !self.bag.is_empty()
    }

    /// Appends a routed external event to the pending bag.
    pub fn add_external(&mut self, event: ExternalEvent) {
        self.bag.push(event);
    }

    /// Runs the dynamics' `init` and seeds the schedule.
    ///
    /// The initial `tn` is the returned time-advance offset from `time`.
    pub fn init(&mut self, time: Time) -> Result<Time, DynamicsError> {
        let ta = self.dynamics.init(time)?;
        self.check_advance(ta)?;
        self.tl = time;
        self.tn = time + ta;
        Ok(self.tn)
    }

    /// Collects the output function's events, tagged with this simulator.
    pub fn output(&mut self, time: Time) -> Result<Vec<OutputEvent>, DynamicsError> {
        let mut bag = OutputBag::new();
        self.dynamics.output(time, &mut bag)?;
        Ok(bag
            .into_events()
            .into_iter()
            .map(|ev| OutputEvent {
                source: self.model,
                port: ev.port,
                value: ev.value,
            })
            .collect())
    }

    /// Fires the internal transition and reschedules.
    pub fn internal(&mut self, time: Time) -> Result<(), DynamicsError> {
        self.dynamics.internal_transition(time)?;
        self.reschedule(time)
    }

    /// Fires the external transition with the pending bag and reschedules.
    pub fn external(&mut self, time: Time) -> Result<(), DynamicsError> {
        let bag = std::mem::take(&mut self.bag);
        self.dynamics.external_transition(time, &bag)?;
        self.reschedule(time)
    }

    /// Fires the confluent transition with the pending bag and reschedules.
    pub fn confluent(&mut self, time: Time) -> Result<(), DynamicsError> {
        let bag = std::mem::take(&mut self.bag);
        self.dynamics.confluent_transition(time, &bag)?;
        self.reschedule(time)
    }

    /// Forwards a synchronous query event, collecting the tagged replies.
    pub fn request(
        &mut self,
        event: &ExternalEvent,
        time: Time,
    ) -> Result<Vec<OutputEvent>, DynamicsError> {
        let mut bag = OutputBag::new();
        self.dynamics.request(event, time, &mut bag)?;
        Ok(bag
            .into_events()
            .into_iter()
            .map(|ev| OutputEvent {
                source: self.model,
                port: ev.port,
                value: ev.value,
            })
            .collect())
    }

    /// Samples the model state for a view.
    pub fn observation(&self, event: &ObservationEvent) -> Value {
        self.dynamics.observation(event)
    }

    /// Tears the dynamics down at end of simulation.
    pub fn finish(&mut self) {
        self.dynamics.finish();
    }

    fn reschedule(&mut self, time: Time) -> Result<(), DynamicsError> {
        let ta = self.dynamics.time_advance();
        self.check_advance(ta)?;
        self.tl = time;
        self.tn = time + ta;
        self.bag.clear();
        Ok(())
    }

    fn check_advance(&self, ta: Time) -> Result<(), DynamicsError> {
        // Time::new already rejects NaN and negatives, but a Dynamics can
        // hand back any Time it likes; keep the contract explicit.
        if ta.as_f64().is_nan() || ta.as_f64() < 0.0 {
            Err(DynamicsError::new(format!(
                "time_advance returned the invalid duration {}",
                ta.as_f64()
            )))
        } else {
            Ok(())
        }
    }
}
