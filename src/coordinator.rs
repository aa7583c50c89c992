//! The simulation coordinator.
//!
//! The coordinator owns the model graph, one [`Simulator`] per atomic
//! model, the event queue, and the observation views. One step pops the
//! imminent set, gathers every output *before any transition fires*, routes
//! the outputs through the coupling graph, then drives confluent, internal
//! and external transitions exactly as the DEVS protocol dictates.
//!
//! Execution is single-threaded cooperative: a step is atomic with respect
//! to external observers, and the graph is read-only while running.

use std::collections::{BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::dynamics::{DynamicsError, ExternalEvent};
use crate::graph::{GraphError, ModelGraph};
use crate::observation::{ModelSample, ObservationEvent, View, ViewPolicy};
use crate::project::ProjectError;
use crate::queue::EventQueue;
use crate::router::route;
use crate::simulator::{OutputEvent, Simulator};
use crate::time::Time;
use crate::types::{ModelId, SimulatorId};
use crate::value::Value;

/// A fatal simulation failure.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("dynamics failure in `{path}`: {source}")]
    Dynamics {
        path: String,
        source: DynamicsError,
    },

    #[error("no dynamics named `{0}` in the registry")]
    UnknownDynamics(String),

    #[error("project error: {0}")]
    Project(#[from] ProjectError),

    #[error("observation I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no project loaded")]
    NotLoaded,
}

/// Whether the loop should keep stepping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// More events remain before the configured duration.
    Continue,
    /// The queue drained or the duration was reached.
    Done,
}

/// Counters maintained across a run.
#[derive(Clone, Debug, Default)]
pub struct CoordinatorStats {
    /// Steps executed since init.
    pub steps_executed: u64,
    /// Output events produced by imminent models.
    pub events_emitted: u64,
    /// Deliveries appended to pending bags.
    pub events_routed: u64,
    /// Outputs with no matching coupling or no simulator behind them.
    pub events_dropped: u64,
    /// Internal transitions fired.
    pub internal_transitions: u64,
    /// External transitions fired.
    pub external_transitions: u64,
    /// Confluent transitions fired.
    pub confluent_transitions: u64,
}

/// The DEVS abstract simulator over one model tree.
pub struct Coordinator {
    graph: ModelGraph,
    simulators: Vec<Simulator>,
    by_model: HashMap<ModelId, SimulatorId>,
    queue: EventQueue,
    views: Vec<View>,
    time: Time,
    begin: Time,
    end: Time,
    stats: CoordinatorStats,
}

impl Coordinator {
    /// Creates a coordinator over `graph`, running from `begin` for
    /// `duration`.
    pub fn new(graph: ModelGraph, begin: Time, duration: Time) -> Self {
        Self {
            graph,
            simulators: Vec::new(),
            by_model: HashMap::new(),
            queue: EventQueue::new(),
            views: Vec::new(),
            time: begin,
            begin,
            end: begin + duration,
            stats: CoordinatorStats::default(),
        }
    }

    /// The model tree.
    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    /// Mutable access to the tree; only valid outside a run.
    pub fn graph_mut(&mut self) -> &mut ModelGraph {
        &mut self.graph
    }

    /// Registers the simulator of one atomic model.
    pub fn register(&mut self, simulator: Simulator) -> SimulatorId {
        let id = SimulatorId(self.simulators.len() as u32);
        self.by_model.insert(simulator.model(), id);
        self.simulators.push(simulator);
        id
    }

    /// The simulator behind an atomic model, if one is registered.
    pub fn simulator_for(&self, model: ModelId) -> Option<SimulatorId> {
        self.by_model.get(&model).copied()
    }

    /// Read access to a simulator.
    pub fn simulator(&self, id: SimulatorId) -> Option<&Simulator> {
        self.simulators.get(id.index())
    }

    /// All registered simulators.
    pub fn simulators(&self) -> impl Iterator<Item = &Simulator> {
        self.simulators.iter()
    }

    /// Registers an observation view.
    pub fn add_view(&mut self, view: View) {
        self.views.push(view);
    }

    /// Looks a view up by name.
    pub fn view(&self, name: &str) -> Option<&View> {
        self.views.iter().find(|v| v.name() == name)
    }

    /// Current simulated time.
    pub fn current_time(&self) -> Time {
        self.time
    }

    /// Absolute end of the run.
    pub fn end_time(&self) -> Time {
        self.end
    }

    /// Shrinks (or extends) the run; effective from the next step.
    pub fn set_duration(&mut self, duration: Time) {
        self.end = self.begin + duration;
    }

    /// Run counters.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// Seeds every simulator, builds the initial queue, opens the views and
    /// takes the initial sample at the begin time.
    pub fn init(&mut self) -> Result<(), SimulationError> {
        self.time = self.begin;
        self.stats = CoordinatorStats::default();

        for index in 0..self.simulators.len() {
            let sid = SimulatorId(index as u32);
            let begin = self.begin;
            let tn = self.simulators[index]
                .init(begin)
                .map_err(|e| self.dynamics_error(sid, e))?;
            self.queue.schedule(sid, tn);
        }

        let begin = self.begin;
        for view in &mut self.views {
            view.open(begin);
        }
        self.observe_views(begin);
        Ok(())
    }

    /// Executes one step of the simulation loop.
    pub fn step(&mut self) -> Result<StepOutcome, SimulationError> {
        let Some(t_next) = self.queue.peek_time() else {
            self.time = Time::INFINITY;
            return Ok(StepOutcome::Done);
        };
        if t_next > self.end {
            self.time = self.end;
            return Ok(StepOutcome::Done);
        }

        let Some((t, imminent)) = self.queue.pop_imminent() else {
            self.time = Time::INFINITY;
            return Ok(StepOutcome::Done);
        };
        self.time = t;

        // Outputs are gathered from the whole imminent set before any
        // transition fires; nothing produced below is visible to this
        // step's transitions.
        let mut produced = Vec::new();
        for &sid in &imminent {
            let events = self.simulators[sid.index()]
                .output(t)
                .map_err(|e| self.dynamics_error(sid, e))?;
            produced.extend(events);
        }
        self.stats.events_emitted += produced.len() as u64;

        let mut receivers: BTreeSet<SimulatorId> = BTreeSet::new();
        for event in produced {
            let destinations = route(&self.graph, event.source, &event.port);
            if destinations.is_empty() {
                self.stats.events_dropped += 1;
                continue;
            }
            for (model, port) in destinations {
                match self.by_model.get(&model) {
                    Some(&sid) => {
                        self.simulators[sid.index()]
                            .add_external(ExternalEvent::new(port, event.value.clone()));
                        receivers.insert(sid);
                        self.stats.events_routed += 1;
                    }
                    None => {
                        // An atomic without a simulator was torn down or
                        // never loaded; treat like an unmatched coupling.
                        self.stats.events_dropped += 1;
                    }
                }
            }
        }

        // Imminent models first, in queue order; a pending bag upgrades the
        // internal transition to a confluent one.
        let imminent_set: HashSet<SimulatorId> = imminent.iter().copied().collect();
        for &sid in &imminent {
            if self.simulators[sid.index()].has_pending() {
                self.simulators[sid.index()]
                    .confluent(t)
                    .map_err(|e| self.dynamics_error(sid, e))?;
                self.stats.confluent_transitions += 1;
            } else {
                self.simulators[sid.index()]
                    .internal(t)
                    .map_err(|e| self.dynamics_error(sid, e))?;
                self.stats.internal_transitions += 1;
            }
            self.queue.schedule(sid, self.simulators[sid.index()].tn());
        }

        // Pure receivers, in simulator order for determinism.
        for &sid in &receivers {
            if imminent_set.contains(&sid) {
                continue;
            }
            self.simulators[sid.index()]
                .external(t)
                .map_err(|e| self.dynamics_error(sid, e))?;
            self.stats.external_transitions += 1;
            self.queue.schedule(sid, self.simulators[sid.index()].tn());
        }

        self.stats.steps_executed += 1;
        self.observe_views(t);
        Ok(StepOutcome::Continue)
    }

    /// Steps until the duration is reached or the queue drains.
    pub fn run(&mut self) -> Result<(), SimulationError> {
        while self.step()? == StepOutcome::Continue {}
        Ok(())
    }

    /// Ends the run: samples finish-policy views, tears down every
    /// dynamics, and closes all view streams.
    pub fn finish(&mut self) -> Result<(), SimulationError> {
        let t = if self.time.is_finite() {
            self.time
        } else {
            self.end
        };

        let simulators = &self.simulators;
        for view in &mut self.views {
            if view.policy() != ViewPolicy::Finish || !view.is_attached() {
                continue;
            }
            let items = collect_samples(simulators, view, t);
            view.emit_value(t, items);
        }

        for simulator in &mut self.simulators {
            simulator.finish();
        }
        for view in &mut self.views {
            view.emit_end(t);
        }
        Ok(())
    }

    /// Issues a synchronous query to an atomic model at the current time.
    ///
    /// Replies are tagged with the queried model but are not routed; the
    /// caller decides what to do with them.
    pub fn request(
        &mut self,
        model: ModelId,
        event: &ExternalEvent,
    ) -> Result<Vec<OutputEvent>, SimulationError> {
        let sid = self
            .simulator_for(model)
            .ok_or_else(|| GraphError::UnknownModel(self.graph.full_path(model)))?;
        let time = self.time;
        self.simulators[sid.index()]
            .request(event, time)
            .map_err(|e| self.dynamics_error(sid, e))
    }

    /// Exports the run counters in a JSON shape.
    pub fn export_stats(&self) -> serde_json::Value {
        serde_json::json!({
            "current_time": if self.time.is_finite() { Some(self.time.as_f64()) } else { None },
            "end_time": self.end.as_f64(),
            "simulator_count": self.simulators.len(),
            "view_count": self.views.len(),
            "steps_executed": self.stats.steps_executed,
            "events_emitted": self.stats.events_emitted,
            "events_routed": self.stats.events_routed,
            "events_dropped": self.stats.events_dropped,
            "internal_transitions": self.stats.internal_transitions,
            "external_transitions": self.stats.external_transitions,
            "confluent_transitions": self.stats.confluent_transitions,
        })
    }

    fn observe_views(&mut self, time: Time) {
        let simulators = &self.simulators;
        for view in &mut self.views {
            if !view.due(time) {
                continue;
            }
            let items = collect_samples(simulators, view, time);
            view.emit_value(time, items);
        }
    }

    fn dynamics_error(&self, sid: SimulatorId, source: DynamicsError) -> SimulationError {
        SimulationError::Dynamics {
            path: self
                .simulators
                .get(sid.index())
                .map(|s| s.path().to_string())
                .unwrap_or_default(),
            source,
        }
    }
}

fn collect_samples(simulators: &[Simulator], view: &View, time: Time) -> Vec<ModelSample> {
    view.observables()
        .iter()
        .map(|o| ModelSample {
            parent: o.parent.clone(),
            simulator: o.name.clone(),
            port: o.port.clone(),
            value: simulators
                .get(o.simulator.index())
                .map(|s| {
                    s.observation(&ObservationEvent {
                        view: view.name().to_string(),
                        port: o.port.clone(),
                        time,
                    })
                })
                .unwrap_or(Value::Null),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{Bag, Dynamics, OutputBag};

    /// Emits `42` every `period` until told otherwise.
    struct Clock {
        period: Time,
    }

    impl Dynamics for Clock {
        fn output(&mut self, _t: Time, out: &mut OutputBag) -> Result<(), DynamicsError> {
            out.emit("out", Value::Integer(42));
            Ok(())
        }

        fn time_advance(&self) -> Time {
            self.period
        }
    }

    /// Passive model that counts what it receives.
    struct Sink {
        received: u64,
    }

    impl Dynamics for Sink {
        fn time_advance(&self) -> Time {
            Time::INFINITY
        }

        fn external_transition(&mut self, _t: Time, bag: &Bag) -> Result<(), DynamicsError> {
            self.received += bag.len() as u64;
            Ok(())
        }

        fn observation(&self, _ev: &ObservationEvent) -> Value {
            Value::Integer(self.received as i64)
        }
    }

    fn one_clock(duration: f64) -> Coordinator {
        let mut graph = ModelGraph::new("top");
        let m = graph.add_atomic(graph.root(), "clock").unwrap();
        graph.add_output_port(m, "out").unwrap();

        let mut coordinator = Coordinator::new(graph, Time::ZERO, Time::new(duration).unwrap());
        let dynamics = Clock {
            period: Time::new(1.0).unwrap(),
        };
        coordinator.register(Simulator::new(m, "top.clock", Box::new(dynamics)));
        coordinator
    }

    #[test]
    fn test_steps_stop_at_duration() {
        let mut c = one_clock(3.0);
        c.init().unwrap();

        assert_eq!(c.step().unwrap(), StepOutcome::Continue); // t = 1
        assert_eq!(c.step().unwrap(), StepOutcome::Continue); // t = 2
        assert_eq!(c.step().unwrap(), StepOutcome::Continue); // t = 3
        assert_eq!(c.step().unwrap(), StepOutcome::Done); // next pop is 4 > 3
        assert_eq!(c.current_time(), Time::new(3.0).unwrap());
        assert_eq!(c.stats().steps_executed, 3);
    }

    #[test]
    fn test_empty_queue_parks_at_infinity() {
        let mut graph = ModelGraph::new("top");
        let m = graph.add_atomic(graph.root(), "idle").unwrap();
        let mut c = Coordinator::new(graph, Time::ZERO, Time::new(5.0).unwrap());
        c.register(Simulator::new(m, "top.idle", Box::new(Sink { received: 0 })));
        c.init().unwrap();

        assert_eq!(c.step().unwrap(), StepOutcome::Done);
        assert!(c.current_time().is_infinite());
    }

    #[test]
    fn test_routed_event_fires_external_transition() {
        let mut graph = ModelGraph::new("top");
        let a = graph.add_atomic(graph.root(), "a").unwrap();
        let b = graph.add_atomic(graph.root(), "b").unwrap();
        graph.add_output_port(a, "out").unwrap();
        graph.add_input_port(b, "in").unwrap();
        graph
            .add_internal_connection(graph.root(), a, "out", b, "in")
            .unwrap();

        let mut c = Coordinator::new(graph, Time::ZERO, Time::new(2.0).unwrap());
        c.register(Simulator::new(
            a,
            "top.a",
            Box::new(Clock {
                period: Time::new(1.0).unwrap(),
            }),
        ));
        let b_sid = c.register(Simulator::new(b, "top.b", Box::new(Sink { received: 0 })));
        c.init().unwrap();
        c.run().unwrap();

        assert_eq!(c.stats().external_transitions, 2);
        assert_eq!(c.stats().events_routed, 2);
        // The sink was touched at t = 2, the last step.
        assert_eq!(c.simulator(b_sid).unwrap().tl(), Time::new(2.0).unwrap());
    }

    #[test]
    fn test_cancellation_by_shrinking_duration() {
        let mut c = one_clock(10.0);
        c.init().unwrap();
        c.step().unwrap();
        c.set_duration(Time::new(1.0).unwrap());
        assert_eq!(c.step().unwrap(), StepOutcome::Done);
        assert_eq!(c.current_time(), Time::new(1.0).unwrap());
    }

    #[test]
    fn test_request_reaches_the_dynamics() {
        struct Oracle;
        impl Dynamics for Oracle {
            fn time_advance(&self) -> Time {
                Time::INFINITY
            }
            fn request(
                &mut self,
                event: &ExternalEvent,
                _time: Time,
                output: &mut crate::dynamics::OutputBag,
            ) -> Result<(), DynamicsError> {
                output.emit("reply", event.value.clone());
                Ok(())
            }
        }

        let mut graph = ModelGraph::new("top");
        let m = graph.add_atomic(graph.root(), "oracle").unwrap();
        let mut c = Coordinator::new(graph, Time::ZERO, Time::new(1.0).unwrap());
        c.register(Simulator::new(m, "top.oracle", Box::new(Oracle)));
        c.init().unwrap();

        let replies = c
            .request(m, &ExternalEvent::new("ask", Value::Integer(5)))
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].port, "reply");
        assert_eq!(replies[0].value, Value::Integer(5));
        assert_eq!(replies[0].source, m);
    }

    #[test]
    fn test_stats_export_shape() {
        let mut c = one_clock(2.0);
        c.init().unwrap();
        c.run().unwrap();
        let stats = c.export_stats();
        assert_eq!(stats["steps_executed"], 2);
        assert_eq!(stats["simulator_count"], 1);
    }
}
