//! The root coordinator.
//!
//! Owns the whole simulation: it builds the model tree from a project
//! description, instantiates one simulator per atomic model through the
//! dynamics registry, wires the observation views, seeds the shared RNG,
//! and drives `init` / `run` / `finish`. Storage view matrices stay
//! readable after the tree is torn down.

use std::collections::HashMap;

use crate::coordinator::{Coordinator, SimulationError};
use crate::dynamics::{DynamicsContext, DynamicsDbg};
use crate::graph::{GraphError, ModelGraph};
use crate::observation::net::TrameWriter;
use crate::observation::{
    Observable, PluginSink, SharedPlugin, StoragePlugin, View, ViewPolicy,
};
use crate::project::{ConnectionKindDef, ModelDef, ModelKindDef, PolicyDef, Project, ProjectError};
use crate::registry::DynamicsRegistry;
use crate::rng::SharedRng;
use crate::simulator::Simulator;
use crate::time::Time;
use crate::types::ModelId;
use crate::value::Value;

/// Top-level driver of one simulation.
#[derive(Default)]
pub struct RootCoordinator {
    coordinator: Option<Coordinator>,
    storages: HashMap<String, SharedPlugin<StoragePlugin>>,
    experiment_name: String,
    final_time: Option<Time>,
}

impl RootCoordinator {
    /// Creates an empty root coordinator; call [`load`](Self::load) next.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the model tree, the simulators and the views from `project`.
    pub fn load(
        &mut self,
        project: &Project,
        registry: &DynamicsRegistry,
    ) -> Result<(), SimulationError> {
        project.validate()?;

        let begin = finite_time(project.experiment.begin, "begin")?;
        let duration = finite_time(project.experiment.duration, "duration")?;
        let rng = SharedRng::seed_from_u64(project.experiment.seed);

        let mut graph = ModelGraph::new(&project.model.name);
        let root = graph.root();
        build_model(&mut graph, root, &project.model)?;

        let mut coordinator = Coordinator::new(graph, begin, duration);
        create_simulators(&mut coordinator, &project.model, root, registry, &rng)?;

        self.storages.clear();
        for view_def in &project.views {
            let policy = match view_def.policy {
                PolicyDef::EachStep => ViewPolicy::EachStep,
                PolicyDef::Timed { step } => ViewPolicy::Timed {
                    step: finite_time(step, "view step")?,
                },
                PolicyDef::Finish => ViewPolicy::Finish,
            };
            let sink: Box<dyn crate::observation::TrameSink> = match view_def.plugin.as_str() {
                "storage" => {
                    let shared = SharedPlugin::new(StoragePlugin::new());
                    self.storages.insert(view_def.name.clone(), shared.clone());
                    Box::new(PluginSink::new(shared))
                }
                "net" => Box::new(TrameWriter::connect(view_def.location.as_str())?),
                other => {
                    return Err(SimulationError::Project(ProjectError::Validation(format!(
                        "unknown observation plugin `{other}` in view `{}`",
                        view_def.name
                    ))))
                }
            };
            let mut view = View::new(&view_def.name, policy, &view_def.location, sink);

            for observable in &project.observables {
                if observable.view != view_def.name {
                    continue;
                }
                let model = coordinator
                    .graph()
                    .find_path(&observable.model)
                    .ok_or_else(|| GraphError::UnknownModel(observable.model.clone()))?;
                let simulator = coordinator
                    .simulator_for(model)
                    .ok_or_else(|| GraphError::UnknownModel(observable.model.clone()))?;
                let parent = coordinator
                    .graph()
                    .parent(model)
                    .map(|p| format!("{}.", coordinator.graph().full_path(p)))
                    .unwrap_or_default();
                let name = coordinator
                    .graph()
                    .name(model)
                    .unwrap_or_default()
                    .to_string();
                view.observe(Observable {
                    simulator,
                    parent,
                    name,
                    port: observable.port.clone(),
                });
            }
            coordinator.add_view(view);
        }

        self.experiment_name = project.experiment.name.clone();
        self.final_time = None;
        self.coordinator = Some(coordinator);
        tracing::info!(
            experiment = %self.experiment_name,
            models = self.coordinator.as_ref().map(|c| c.graph().len()).unwrap_or(0),
            "project loaded"
        );
        Ok(())
    }

    /// Seeds every dynamics and builds the initial event queue.
    pub fn init(&mut self) -> Result<(), SimulationError> {
        self.coordinator
            .as_mut()
            .ok_or(SimulationError::NotLoaded)?
            .init()
    }

    /// Runs until the configured duration or queue exhaustion.
    pub fn run(&mut self) -> Result<(), SimulationError> {
        self.coordinator
            .as_mut()
            .ok_or(SimulationError::NotLoaded)?
            .run()
    }

    /// Finishes every dynamics, closes the views and tears the tree down.
    pub fn finish(&mut self) -> Result<(), SimulationError> {
        let mut coordinator = self.coordinator.take().ok_or(SimulationError::NotLoaded)?;
        coordinator.finish()?;
        self.final_time = Some(coordinator.current_time().min(coordinator.end_time()));
        Ok(())
    }

    /// The live coordinator, between `load` and `finish`.
    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    /// Current simulated time, or the final time after `finish`.
    pub fn current_time(&self) -> Option<Time> {
        self.coordinator
            .as_ref()
            .map(|c| c.current_time())
            .or(self.final_time)
    }

    /// The storage matrix of a view, rendered as a table value.
    ///
    /// Available during and after the run, including after `finish`.
    pub fn output_table(&self, view: &str) -> Option<Value> {
        self.storages.get(view).map(|s| s.with(|p| p.to_table()))
    }

    /// Runs `f` against a view's storage plugin.
    pub fn with_storage<R>(&self, view: &str, f: impl FnOnce(&StoragePlugin) -> R) -> Option<R> {
        self.storages.get(view).map(|s| s.with(f))
    }

    /// The run counters, exported as JSON.
    pub fn export_stats(&self) -> serde_json::Value {
        match &self.coordinator {
            Some(c) => c.export_stats(),
            None => serde_json::json!({ "experiment": self.experiment_name }),
        }
    }
}

/// One-shot convenience: load, init, run and finish `project`.
pub fn simulate(
    project: &Project,
    registry: &DynamicsRegistry,
) -> Result<RootCoordinator, SimulationError> {
    let mut root = RootCoordinator::new();
    root.load(project, registry)?;
    root.init()?;
    root.run()?;
    root.finish()?;
    Ok(root)
}

fn finite_time(value: f64, what: &str) -> Result<Time, SimulationError> {
    Time::new(value)
        .filter(|t| t.is_finite())
        .ok_or_else(|| {
            SimulationError::Project(ProjectError::Validation(format!(
                "{what} {value} is not a finite non-negative time"
            )))
        })
}

fn build_model(graph: &mut ModelGraph, id: ModelId, def: &ModelDef) -> Result<(), GraphError> {
    for port in &def.inputs {
        graph.add_input_port(id, port)?;
    }
    for port in &def.outputs {
        graph.add_output_port(id, port)?;
    }
    for child_def in &def.submodels {
        let child = match child_def.kind {
            ModelKindDef::Atomic => graph.add_atomic(id, &child_def.name)?,
            ModelKindDef::Coupled => graph.add_coupled(id, &child_def.name)?,
            ModelKindDef::Opaque => graph.add_opaque(id, &child_def.name)?,
        };
        build_model(graph, child, child_def)?;
    }
    for connection in &def.connections {
        let child = |graph: &ModelGraph, name: &str| -> Result<ModelId, GraphError> {
            graph
                .find_child(id, name)
                .ok_or_else(|| GraphError::UnknownModel(name.to_string()))
        };
        match connection.kind {
            ConnectionKindDef::Input => {
                let dst = child(graph, &connection.destination.model)?;
                graph.add_input_connection(
                    id,
                    &connection.origin.port,
                    dst,
                    &connection.destination.port,
                )?;
            }
            ConnectionKindDef::Output => {
                let src = child(graph, &connection.origin.model)?;
                graph.add_output_connection(
                    id,
                    src,
                    &connection.origin.port,
                    &connection.destination.port,
                )?;
            }
            ConnectionKindDef::Internal => {
                let src = child(graph, &connection.origin.model)?;
                let dst = child(graph, &connection.destination.model)?;
                graph.add_internal_connection(
                    id,
                    src,
                    &connection.origin.port,
                    dst,
                    &connection.destination.port,
                )?;
            }
        }
    }
    Ok(())
}

fn create_simulators(
    coordinator: &mut Coordinator,
    def: &ModelDef,
    id: ModelId,
    registry: &DynamicsRegistry,
    rng: &SharedRng,
) -> Result<(), SimulationError> {
    if def.kind == ModelKindDef::Atomic {
        let path = coordinator.graph().full_path(id);
        let name = def
            .dynamics
            .as_deref()
            .ok_or_else(|| SimulationError::UnknownDynamics(path.clone()))?;
        let context = DynamicsContext::new(path.clone(), rng.clone());
        let mut dynamics = registry
            .create(name, context, &def.attrs)
            .ok_or_else(|| SimulationError::UnknownDynamics(name.to_string()))?;
        if def.debug {
            dynamics = Box::new(DynamicsDbg::new(path.clone(), dynamics));
        }
        coordinator.register(Simulator::new(id, path, dynamics));
        return Ok(());
    }

    for child_def in &def.submodels {
        let child = coordinator
            .graph()
            .find_child(id, &child_def.name)
            .ok_or_else(|| GraphError::UnknownModel(child_def.name.clone()))?;
        create_simulators(coordinator, child_def, child, registry, rng)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::{Bag, Dynamics, DynamicsError, OutputBag};
    use crate::observation::ObservationEvent;
    use crate::project::ViewDef;

    struct Pulse {
        period: Time,
        count: i64,
    }

    impl Dynamics for Pulse {
        fn output(&mut self, _t: Time, out: &mut OutputBag) -> Result<(), DynamicsError> {
            out.emit("out", Value::Integer(self.count));
            Ok(())
        }

        fn time_advance(&self) -> Time {
            self.period
        }

        fn internal_transition(&mut self, _t: Time) -> Result<(), DynamicsError> {
            self.count += 1;
            Ok(())
        }
    }

    struct Counter {
        count: i64,
    }

    impl Dynamics for Counter {
        fn time_advance(&self) -> Time {
            Time::INFINITY
        }

        fn external_transition(&mut self, _t: Time, bag: &Bag) -> Result<(), DynamicsError> {
            self.count += bag.len() as i64;
            Ok(())
        }

        fn observation(&self, _ev: &ObservationEvent) -> Value {
            Value::Integer(self.count)
        }
    }

    fn registry() -> DynamicsRegistry {
        let mut registry = DynamicsRegistry::new();
        registry.register("pulse", |_ctx, attrs| {
            let period = attrs
                .get("period")
                .and_then(|s| s.parse().ok())
                .and_then(Time::new)
                .unwrap_or(Time::INFINITY);
            Box::new(Pulse { period, count: 0 })
        });
        registry.register("counter", |_ctx, _attrs| Box::new(Counter { count: 0 }));
        registry
    }

    fn project(duration: f64) -> Project {
        let mut project = Project::new(
            ModelDef::coupled("top")
                .with_submodel(
                    ModelDef::atomic("gen", "pulse")
                        .with_attr("period", "1.0")
                        .with_output("out"),
                )
                .with_submodel(ModelDef::atomic("sink", "counter").with_input("in"))
                .with_internal_connection("gen", "out", "sink", "in"),
        )
        .with_view(ViewDef {
            name: "main".into(),
            plugin: "storage".into(),
            location: String::new(),
            policy: PolicyDef::EachStep,
        })
        .with_observable("top.sink", "count", "main");
        project.experiment.duration = duration;
        project
    }

    #[test]
    fn test_end_to_end_run() {
        let root = simulate(&project(3.0), &registry()).unwrap();
        assert_eq!(root.current_time(), Some(Time::new(3.0).unwrap()));

        // Initial sample plus one per step at t = 1, 2, 3.
        root.with_storage("main", |storage| {
            assert_eq!(storage.times(), &[0.0, 1.0, 2.0, 3.0]);
            let col = storage.column_index("top.sink", "count").unwrap();
            assert_eq!(storage.get(col, 0), Some(&Value::Integer(0)));
            assert_eq!(storage.get(col, 3), Some(&Value::Integer(3)));
            assert_eq!(storage.last_time(), Some(3.0));
        })
        .unwrap();
    }

    #[test]
    fn test_unknown_dynamics_is_fatal_at_load() {
        let mut bad = project(1.0);
        bad.model.submodels[0].dynamics = Some("missing".into());
        let mut root = RootCoordinator::new();
        assert!(matches!(
            root.load(&bad, &registry()),
            Err(SimulationError::UnknownDynamics(_))
        ));
    }

    #[test]
    fn test_run_before_load_fails() {
        let mut root = RootCoordinator::new();
        assert!(matches!(root.run(), Err(SimulationError::NotLoaded)));
    }

    #[test]
    fn test_output_survives_finish() {
        let root = simulate(&project(2.0), &registry()).unwrap();
        let table = root.output_table("main").unwrap();
        let table = table.as_table().unwrap();
        // time column + one observable, three rows (t = 0, 1, 2).
        assert_eq!(table.columns(), 2);
        assert_eq!(table.rows(), 3);
    }

    #[test]
    fn test_same_seed_reproduces_draws() {
        // Two runs with the same seed must behave identically; exercised
        // through a dynamics that samples the shared generator.
        struct Noisy {
            rng: SharedRng,
            last: f64,
        }
        impl Dynamics for Noisy {
            fn time_advance(&self) -> Time {
                Time::new(1.0).unwrap_or(Time::INFINITY)
            }
            fn internal_transition(&mut self, _t: Time) -> Result<(), DynamicsError> {
                self.last = self.rng.next_f64();
                Ok(())
            }
            fn observation(&self, _ev: &ObservationEvent) -> Value {
                Value::Double(self.last)
            }
        }

        let mut registry = DynamicsRegistry::new();
        registry.register("noisy", |ctx, _attrs| {
            Box::new(Noisy {
                rng: ctx.rng,
                last: 0.0,
            })
        });

        let build = || {
            let mut p = Project::new(
                ModelDef::coupled("top")
                    .with_submodel(ModelDef::atomic("n", "noisy").with_output("out")),
            )
            .with_view(ViewDef {
                name: "v".into(),
                plugin: "storage".into(),
                location: String::new(),
                policy: PolicyDef::Finish,
            })
            .with_observable("top.n", "last", "v");
            p.experiment.duration = 4.0;
            p.experiment.seed = 99;
            p
        };

        let a = simulate(&build(), &registry).unwrap();
        let b = simulate(&build(), &registry).unwrap();
        let read = |r: &RootCoordinator| {
            r.with_storage("v", |s| {
                let col = s.column_index("top.n", "last").unwrap();
                s.get(col, 0).cloned()
            })
            .unwrap()
        };
        assert_eq!(read(&a), read(&b));
    }
}
