//! Observation: views, trames, plugins, and delivery.
//!
//! A *view* names a set of observables (atomic model, port) and a sampling
//! schedule. When the schedule triggers, the coordinator pulls one sample
//! per observable and emits a `value` trame on the view's sink. Sinks are
//! either in-process plugins ([`plugin::PluginSink`]), a bounded queue
//! ([`bus`]), or a framed TCP stream to the observation daemon ([`net`]).

pub mod bus;
pub mod net;
pub mod plugin;
pub mod storage;
pub mod trame;

pub use plugin::{PluginSink, SharedPlugin, ViewPlugin};
pub use storage::StoragePlugin;
pub use trame::{ModelSample, ProtocolError, Trame};

use crate::time::Time;
use crate::types::SimulatorId;

/// The descriptor handed to [`Dynamics::observation`](crate::dynamics::Dynamics::observation).
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationEvent {
    /// The requesting view.
    pub view: String,
    /// The observed port or state-variable name.
    pub port: String,
    /// The sampling time.
    pub time: Time,
}

/// When a view samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ViewPolicy {
    /// After every coordinator step (and once at init).
    EachStep,
    /// On a fixed period from the experiment's begin time.
    Timed {
        /// Sampling period; finite and positive.
        step: Time,
    },
    /// Once, when the simulation finishes.
    Finish,
}

/// One observed column of a view.
#[derive(Clone, Debug, PartialEq)]
pub struct Observable {
    /// The simulator sampled.
    pub simulator: SimulatorId,
    /// Path of the containing coupled model, trailing separator included.
    pub parent: String,
    /// Name of the atomic model.
    pub name: String,
    /// The observed port or state-variable name.
    pub port: String,
}

/// Destination of a view's trame stream.
pub trait TrameSink: Send {
    /// Delivers one trame, in per-view order.
    fn deliver(&mut self, trame: &Trame) -> Result<(), ProtocolError>;
}

/// A registered observation view.
pub struct View {
    name: String,
    location: String,
    policy: ViewPolicy,
    sink: Box<dyn TrameSink>,
    observed: Vec<Observable>,
    attached: bool,
    next: Option<Time>,
}

impl View {
    /// Creates a view delivering into `sink`.
    pub fn new(
        name: impl Into<String>,
        policy: ViewPolicy,
        location: impl Into<String>,
        sink: Box<dyn TrameSink>,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            policy,
            sink,
            observed: Vec::new(),
            attached: true,
            next: None,
        }
    }

    /// The view name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The sampling policy.
    pub fn policy(&self) -> ViewPolicy {
        self.policy
    }

    /// The observed columns, in registration order.
    pub fn observables(&self) -> &[Observable] {
        &self.observed
    }

    /// False once a protocol error detached the view.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Registers one observable column.
    pub fn observe(&mut self, observable: Observable) {
        self.observed.push(observable);
    }

    /// Opens the stream: parameter trame, then one `new_observable` per
    /// column. Called once by the coordinator at init.
    pub(crate) fn open(&mut self, begin: Time) {
        let parameter = Trame::Parameter {
            view: self.name.clone(),
            data: self.location.clone(),
        };
        self.send(&parameter);
        let columns: Vec<Trame> = self
            .observed
            .iter()
            .map(|o| Trame::NewObservable {
                view: self.name.clone(),
                parent: o.parent.clone(),
                simulator: o.name.clone(),
                port: o.port.clone(),
            })
            .collect();
        for trame in &columns {
            self.send(trame);
        }
        if let ViewPolicy::Timed { .. } = self.policy {
            self.next = Some(begin);
        }
    }

    /// True when the schedule triggers at `time` during a step.
    pub(crate) fn due(&self, time: Time) -> bool {
        if !self.attached {
            return false;
        }
        match self.policy {
            ViewPolicy::EachStep => true,
            ViewPolicy::Timed { .. } => self.next.map(|n| time >= n).unwrap_or(false),
            ViewPolicy::Finish => false,
        }
    }

    /// Emits one `value` trame and advances the schedule.
    pub(crate) fn emit_value(&mut self, time: Time, items: Vec<ModelSample>) {
        let trame = Trame::Value {
            view: self.name.clone(),
            time: time.as_f64(),
            items,
        };
        self.send(&trame);
        if let ViewPolicy::Timed { step } = self.policy {
            if let Some(mut next) = self.next {
                while next <= time {
                    next += step;
                }
                self.next = Some(next);
            }
        }
    }

    /// Emits the `end` trame closing the stream.
    pub(crate) fn emit_end(&mut self, time: Time) {
        let trame = Trame::End {
            view: self.name.clone(),
            time: time.as_f64(),
        };
        self.send(&trame);
    }

    /// Delivers one trame; a protocol error detaches the view for good.
    fn send(&mut self, trame: &Trame) {
        if !self.attached {
            return;
        }
        if let Err(err) = self.sink.deliver(trame) {
            tracing::warn!(view = %self.name, error = %err, "detaching observation view");
            self.attached = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Capture {
        trames: Arc<Mutex<Vec<Trame>>>,
        fail: bool,
    }

    impl TrameSink for Capture {
        fn deliver(&mut self, trame: &Trame) -> Result<(), ProtocolError> {
            if self.fail {
                return Err(ProtocolError::UnknownTag(0));
            }
            self.trames.lock().push(trame.clone());
            Ok(())
        }
    }

    fn observable() -> Observable {
        Observable {
            simulator: SimulatorId(0),
            parent: "top.".into(),
            name: "a".into(),
            port: "out".into(),
        }
    }

    #[test]
    fn test_open_emits_parameter_then_columns() {
        let capture = Capture::default();
        let trames = Arc::clone(&capture.trames);
        let mut view = View::new("v", ViewPolicy::EachStep, "loc", Box::new(capture));
        view.observe(observable());
        view.open(Time::ZERO);

        let seen = trames.lock();
        assert_eq!(seen.len(), 2);
        assert!(matches!(seen[0], Trame::Parameter { .. }));
        assert!(matches!(seen[1], Trame::NewObservable { .. }));
    }

    #[test]
    fn test_timed_schedule_advances() {
        let capture = Capture::default();
        let mut view = View::new(
            "v",
            ViewPolicy::Timed {
                step: Time::new(2.0).unwrap(),
            },
            "",
            Box::new(capture),
        );
        view.open(Time::ZERO);

        assert!(view.due(Time::ZERO));
        view.emit_value(Time::ZERO, Vec::new());
        assert!(!view.due(Time::new(1.0).unwrap()));
        assert!(view.due(Time::new(2.0).unwrap()));

        // Jumping past several periods resynchronizes past the sample time.
        view.emit_value(Time::new(5.0).unwrap(), Vec::new());
        assert!(!view.due(Time::new(5.5).unwrap()));
        assert!(view.due(Time::new(6.0).unwrap()));
    }

    #[test]
    fn test_finish_policy_never_due_during_run() {
        let view = View::new("v", ViewPolicy::Finish, "", Box::new(Capture::default()));
        assert!(!view.due(Time::ZERO));
        assert!(!view.due(Time::new(100.0).unwrap()));
    }

    #[test]
    fn test_protocol_error_detaches_but_does_not_panic() {
        let capture = Capture {
            fail: true,
            ..Capture::default()
        };
        let mut view = View::new("v", ViewPolicy::EachStep, "", Box::new(capture));
        view.observe(observable());
        view.open(Time::ZERO);

        assert!(!view.is_attached());
        // Further emissions are silently skipped.
        view.emit_value(
            Time::ZERO,
            vec![ModelSample {
                parent: "top.".into(),
                simulator: "a".into(),
                port: "out".into(),
                value: Value::Integer(1),
            }],
        );
    }
}
