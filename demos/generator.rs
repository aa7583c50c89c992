//! Minimal end-to-end run: a periodic generator feeding a counter, with a
//! storage view sampling after every step.
//!
//! ```sh
//! cargo run --example generator
//! ```

use std::collections::HashMap;

use veld::dynamics::{Bag, Dynamics, DynamicsContext, DynamicsError, OutputBag};
use veld::observation::ObservationEvent;
use veld::project::{Experiment, ModelDef, PolicyDef, Project, ViewDef};
use veld::registry::DynamicsRegistry;
use veld::root::simulate;
use veld::time::Time;
use veld::value::Value;

/// Emits an increasing integer on "out" every `period`.
struct Generator {
    period: Time,
    count: i64,
}

impl Generator {
    fn from_attrs(attrs: &HashMap<String, String>) -> Self {
        let period = attrs
            .get("period")
            .and_then(|s| s.parse().ok())
            .and_then(Time::new)
            .unwrap_or(Time::INFINITY);
        Self { period, count: 0 }
    }
}

impl Dynamics for Generator {
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

/// Counts everything it receives.
struct Counter {
    total: i64,
}

impl Dynamics for Counter {
    fn time_advance(&self) -> Time {
        Time::INFINITY
    }

    fn external_transition(&mut self, _t: Time, bag: &Bag) -> Result<(), DynamicsError> {
        self.total += bag.len() as i64;
        Ok(())
    }

    fn observation(&self, _ev: &ObservationEvent) -> Value {
        Value::Integer(self.total)
    }
}

fn main() {
    let mut registry = DynamicsRegistry::new();
    registry.register("generator", |_ctx: DynamicsContext, attrs| {
        Box::new(Generator::from_attrs(attrs))
    });
    registry.register("counter", |_ctx, _attrs| Box::new(Counter { total: 0 }));

    let project = Project::new(
        ModelDef::coupled("top")
            .with_submodel(
                ModelDef::atomic("gen", "generator")
                    .with_attr("period", "1.0")
                    .with_output("out"),
            )
            .with_submodel(ModelDef::atomic("sink", "counter").with_input("in"))
            .with_internal_connection("gen", "out", "sink", "in"),
    )
    .with_experiment(Experiment {
        name: "generator-demo".into(),
        duration: 10.0,
        begin: 0.0,
        seed: 1,
    })
    .with_view(ViewDef {
        name: "main".into(),
        plugin: "storage".into(),
        location: String::new(),
        policy: PolicyDef::EachStep,
    })
    .with_observable("top.sink", "total", "main");

    let root = simulate(&project, &registry).expect("simulation failed");

    println!("stats: {}", root.export_stats());
    root.with_storage("main", |storage| {
        let col = storage.column_index("top.sink", "total").expect("column");
        for (row, time) in storage.times().iter().enumerate() {
            println!("t={time:>4}  received={}", storage.get(col, row).expect("cell"));
        }
    })
    .expect("storage view");
}
