//! A nested model: stochastic rain falls on a soil store inside a `field`
//! coupled model; overflow exits the field and feeds a river downstream.
//! Demonstrates hierarchical routing, the shared RNG, and a timed view.
//!
//! ```sh
//! cargo run --example watershed
//! ```

use veld::dynamics::{Bag, Dynamics, DynamicsError, OutputBag};
use veld::observation::ObservationEvent;
use veld::project::{Experiment, ModelDef, PolicyDef, Project, ViewDef};
use veld::registry::DynamicsRegistry;
use veld::rng::SharedRng;
use veld::root::simulate;
use veld::time::Time;
use veld::value::Value;

/// Drops a random quantity of rain every time unit.
struct Rain {
    rng: SharedRng,
    last: f64,
}

impl Dynamics for Rain {
    fn output(&mut self, _t: Time, out: &mut OutputBag) -> Result<(), DynamicsError> {
        out.emit("drop", Value::Double(self.last));
        Ok(())
    }

    fn time_advance(&self) -> Time {
        Time::new(1.0).unwrap_or(Time::INFINITY)
    }

    fn init(&mut self, _t: Time) -> Result<Time, DynamicsError> {
        self.last = self.rng.next_f64() * 10.0;
        Ok(self.time_advance())
    }

    fn internal_transition(&mut self, _t: Time) -> Result<(), DynamicsError> {
        self.last = self.rng.next_f64() * 10.0;
        Ok(())
    }
}

/// Stores water up to a capacity; the excess spills on the next firing.
struct Soil {
    stored: f64,
    capacity: f64,
    spill: f64,
}

impl Dynamics for Soil {
    fn output(&mut self, _t: Time, out: &mut OutputBag) -> Result<(), DynamicsError> {
        if self.spill > 0.0 {
            out.emit("overflow", Value::Double(self.spill));
        }
        Ok(())
    }

    fn time_advance(&self) -> Time {
        if self.spill > 0.0 {
            Time::ZERO
        } else {
            Time::INFINITY
        }
    }

    fn internal_transition(&mut self, _t: Time) -> Result<(), DynamicsError> {
        self.spill = 0.0;
        Ok(())
    }

    fn external_transition(&mut self, _t: Time, bag: &Bag) -> Result<(), DynamicsError> {
        for event in bag {
            self.stored += event.value.as_double().unwrap_or(0.0);
        }
        if self.stored > self.capacity {
            self.spill = self.stored - self.capacity;
            self.stored = self.capacity;
        }
        Ok(())
    }

    fn observation(&self, _ev: &ObservationEvent) -> Value {
        Value::Double(self.stored)
    }
}

/// Accumulates inflow.
struct River {
    level: f64,
}

impl Dynamics for River {
    fn time_advance(&self) -> Time {
        Time::INFINITY
    }

    fn external_transition(&mut self, _t: Time, bag: &Bag) -> Result<(), DynamicsError> {
        for event in bag {
            self.level += event.value.as_double().unwrap_or(0.0);
        }
        Ok(())
    }

    fn observation(&self, _ev: &ObservationEvent) -> Value {
        Value::Double(self.level)
    }
}

fn main() {
    let mut registry = DynamicsRegistry::new();
    registry.register("rain", |ctx, _attrs| {
        Box::new(Rain {
            rng: ctx.rng,
            last: 0.0,
        })
    });
    registry.register("soil", |_ctx, attrs| {
        let capacity = attrs
            .get("capacity")
            .and_then(|s| s.parse().ok())
            .unwrap_or(25.0);
        Box::new(Soil {
            stored: 0.0,
            capacity,
            spill: 0.0,
        })
    });
    registry.register("river", |_ctx, _attrs| Box::new(River { level: 0.0 }));

    let field = ModelDef::coupled("field")
        .with_output("out")
        .with_submodel(ModelDef::atomic("rain", "rain").with_output("drop"))
        .with_submodel(
            ModelDef::atomic("soil", "soil")
                .with_attr("capacity", "25.0")
                .with_input("in")
                .with_output("overflow"),
        )
        .with_internal_connection("rain", "drop", "soil", "in")
        .with_output_connection("soil", "overflow", "out");

    let project = Project::new(
        ModelDef::coupled("basin")
            .with_submodel(field)
            .with_submodel(ModelDef::atomic("river", "river").with_input("in"))
            .with_internal_connection("field", "out", "river", "in"),
    )
    .with_experiment(Experiment {
        name: "watershed".into(),
        duration: 20.0,
        begin: 0.0,
        seed: 2024,
    })
    .with_view(ViewDef {
        name: "levels".into(),
        plugin: "storage".into(),
        location: String::new(),
        policy: PolicyDef::Timed { step: 5.0 },
    })
    .with_observable("basin.field.soil", "stored", "levels")
    .with_observable("basin.river", "level", "levels");

    let root = simulate(&project, &registry).expect("simulation failed");

    println!("stats: {}", root.export_stats());
    root.with_storage("levels", |storage| {
        let soil = storage.column_index("basin.field.soil", "stored").expect("soil");
        let river = storage.column_index("basin.river", "level").expect("river");
        println!("{:>6} {:>10} {:>10}", "t", "soil", "river");
        for (row, time) in storage.times().iter().enumerate() {
            println!(
                "{:>6} {:>10} {:>10}",
                time,
                storage.get(soil, row).expect("cell"),
                storage.get(river, row).expect("cell"),
            );
        }
    })
    .expect("storage view");
}
