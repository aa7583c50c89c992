//! Declarative project descriptions.
//!
//! A [`Project`] is the in-memory form the root coordinator consumes: the
//! experiment frame (duration, begin, seed), the model tree with its ports
//! and connections, the observation views, and the observable mapping.
//! Projects decode from YAML or JSON, or are assembled programmatically.
//!
//! # Project File Structure
//!
//! ```yaml
//! experiment:
//!   name: demo
//!   duration: 100.0
//!   seed: 42
//!
//! model:
//!   name: top
//!   type: coupled
//!   submodels:
//!     - name: gen
//!       type: atomic
//!       dynamics: generator
//!       outputs: [out]
//!     - name: sink
//!       type: atomic
//!       dynamics: counter
//!       inputs: [in]
//!   connections:
//!     - type: internal
//!       origin: { model: gen, port: out }
//!       destination: { model: sink, port: in }
//!
//! views:
//!   - name: main
//!     plugin: storage
//!     policy: each_step
//!
//! observables:
//!   - model: top.sink
//!     port: count
//!     view: main
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a project description.
#[derive(Error, Debug)]
pub enum ProjectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown file format: {0}")]
    UnknownFormat(String),
}

/// Result type for project operations.
pub type ProjectResult<T> = Result<T, ProjectError>;

/// The experiment frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experiment {
    /// Experiment name, used in logs and stats.
    #[serde(default)]
    pub name: String,

    /// Simulated duration of the run.
    #[serde(default = "default_duration")]
    pub duration: f64,

    /// Initial simulated time.
    #[serde(default)]
    pub begin: f64,

    /// Seed of the simulation-wide generator.
    #[serde(default)]
    pub seed: u64,
}

fn default_duration() -> f64 {
    100.0
}

impl Default for Experiment {
    fn default() -> Self {
        Self {
            name: String::new(),
            duration: default_duration(),
            begin: 0.0,
            seed: 0,
        }
    }
}

/// Kind discriminator of a model definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKindDef {
    Atomic,
    Coupled,
    Opaque,
}

/// One endpoint of a connection definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointDef {
    /// Child name, or the coupled model's own name for its ports.
    pub model: String,
    /// Port name on that model.
    pub port: String,
}

/// Connection kind discriminator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKindDef {
    /// Coupled input port to a child input port.
    Input,
    /// Child output port to the coupled output port.
    Output,
    /// Child output port to a sibling input port.
    Internal,
}

/// A connection inside one coupled model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionDef {
    /// The coupling kind.
    #[serde(rename = "type")]
    pub kind: ConnectionKindDef,
    /// Source endpoint.
    pub origin: EndpointDef,
    /// Destination endpoint.
    pub destination: EndpointDef,
}

/// One node of the described model tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelDef {
    /// Name, unique among siblings.
    pub name: String,

    /// Atomic, coupled or opaque.
    #[serde(rename = "type")]
    pub kind: ModelKindDef,

    /// Registered dynamics name (atomic models only).
    #[serde(default)]
    pub dynamics: Option<String>,

    /// Attributes handed to the dynamics factory.
    #[serde(default)]
    pub attrs: HashMap<String, String>,

    /// Wrap the dynamics in the tracing debug decorator.
    #[serde(default)]
    pub debug: bool,

    /// Input port names, in declaration order.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Output port names, in declaration order.
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Children (coupled models only).
    #[serde(default)]
    pub submodels: Vec<ModelDef>,

    /// Couplings among this model's ports and its children.
    #[serde(default)]
    pub connections: Vec<ConnectionDef>,
}

impl ModelDef {
    /// Starts an atomic model definition.
    pub fn atomic(name: impl Into<String>, dynamics: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ModelKindDef::Atomic,
            dynamics: Some(dynamics.into()),
            attrs: HashMap::new(),
            debug: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            submodels: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Starts a coupled model definition.
    pub fn coupled(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ModelKindDef::Coupled,
            dynamics: None,
            attrs: HashMap::new(),
            debug: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            submodels: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Starts an opaque placeholder definition.
    pub fn opaque(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ModelKindDef::Opaque,
            dynamics: None,
            attrs: HashMap::new(),
            debug: false,
            inputs: Vec::new(),
            outputs: Vec::new(),
            submodels: Vec::new(),
            connections: Vec::new(),
        }
    }

    /// Adds an attribute for the dynamics factory.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Enables the debug decorator around this model's dynamics.
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Declares an input port.
    pub fn with_input(mut self, port: impl Into<String>) -> Self {
        self.inputs.push(port.into());
        self
    }

    /// Declares an output port.
    pub fn with_output(mut self, port: impl Into<String>) -> Self {
        self.outputs.push(port.into());
        self
    }

    /// Adds a child model.
    pub fn with_submodel(mut self, child: ModelDef) -> Self {
        self.submodels.push(child);
        self
    }

    /// Adds an input coupling: own input port to a child input port.
    pub fn with_input_connection(
        mut self,
        src_port: impl Into<String>,
        child: impl Into<String>,
        child_port: impl Into<String>,
    ) -> Self {
        self.connections.push(ConnectionDef {
            kind: ConnectionKindDef::Input,
            origin: EndpointDef {
                model: self.name.clone(),
                port: src_port.into(),
            },
            destination: EndpointDef {
                model: child.into(),
                port: child_port.into(),
            },
        });
        self
    }

    /// Adds an output coupling: a child output port to an own output port.
    pub fn with_output_connection(
        mut self,
        child: impl Into<String>,
        child_port: impl Into<String>,
        dst_port: impl Into<String>,
    ) -> Self {
        self.connections.push(ConnectionDef {
            kind: ConnectionKindDef::Output,
            origin: EndpointDef {
                model: child.into(),
                port: child_port.into(),
            },
            destination: EndpointDef {
                model: self.name.clone(),
                port: dst_port.into(),
            },
        });
        self
    }

    /// Adds an internal coupling between two children.
    pub fn with_internal_connection(
        mut self,
        src: impl Into<String>,
        src_port: impl Into<String>,
        dst: impl Into<String>,
        dst_port: impl Into<String>,
    ) -> Self {
        self.connections.push(ConnectionDef {
            kind: ConnectionKindDef::Internal,
            origin: EndpointDef {
                model: src.into(),
                port: src_port.into(),
            },
            destination: EndpointDef {
                model: dst.into(),
                port: dst_port.into(),
            },
        });
        self
    }

    fn validate(&self, path: &str) -> ProjectResult<()> {
        let here = if path.is_empty() {
            self.name.clone()
        } else {
            format!("{path}.{}", self.name)
        };

        match self.kind {
            ModelKindDef::Atomic => {
                if self.dynamics.is_none() {
                    return Err(ProjectError::Validation(format!(
                        "atomic model `{here}` names no dynamics"
                    )));
                }
                if !self.submodels.is_empty() || !self.connections.is_empty() {
                    return Err(ProjectError::Validation(format!(
                        "atomic model `{here}` cannot have submodels or connections"
                    )));
                }
            }
            ModelKindDef::Coupled => {
                if self.dynamics.is_some() {
                    tracing::warn!(model = %here, "coupled model names a dynamics (ignored)");
                }
            }
            ModelKindDef::Opaque => {
                if !self.submodels.is_empty() {
                    return Err(ProjectError::Validation(format!(
                        "opaque model `{here}` cannot have submodels"
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for child in &self.submodels {
            if !seen.insert(child.name.as_str()) {
                return Err(ProjectError::Validation(format!(
                    "duplicate submodel `{}` under `{here}`",
                    child.name
                )));
            }
            child.validate(&here)?;
        }

        for connection in &self.connections {
            self.validate_connection(&here, connection)?;
        }
        Ok(())
    }

    fn validate_connection(&self, here: &str, c: &ConnectionDef) -> ProjectResult<()> {
        let find = |name: &str| self.submodels.iter().find(|m| m.name == name);
        let check = |endpoint: &EndpointDef, want_input: bool| -> ProjectResult<()> {
            let (ports, side) = if endpoint.model == self.name {
                // The coupled model's own port: an input coupling starts on
                // an input port, an output coupling ends on an output port.
                if want_input {
                    (&self.inputs, "input")
                } else {
                    (&self.outputs, "output")
                }
            } else {
                let child = find(&endpoint.model).ok_or_else(|| {
                    ProjectError::Validation(format!(
                        "connection in `{here}` references unknown model `{}`",
                        endpoint.model
                    ))
                })?;
                if want_input {
                    (&child.inputs, "input")
                } else {
                    (&child.outputs, "output")
                }
            };
            if !ports.iter().any(|p| p == &endpoint.port) {
                return Err(ProjectError::Validation(format!(
                    "connection in `{here}` references missing {side} port `{}:{}`",
                    endpoint.model, endpoint.port
                )));
            }
            Ok(())
        };

        match c.kind {
            ConnectionKindDef::Input => {
                check(&c.origin, true)?;
                check(&c.destination, true)?;
            }
            ConnectionKindDef::Output => {
                check(&c.origin, false)?;
                check(&c.destination, false)?;
            }
            ConnectionKindDef::Internal => {
                check(&c.origin, false)?;
                check(&c.destination, true)?;
            }
        }
        Ok(())
    }
}

/// Scheduling policy of a view definition.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PolicyDef {
    /// Sample after every step.
    EachStep,
    /// Sample on a fixed period.
    Timed {
        /// Sampling period; must be finite and positive.
        step: f64,
    },
    /// Sample once at the end of the run.
    Finish,
}

/// One observation view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViewDef {
    /// View name, unique in the project.
    pub name: String,

    /// Observation plugin: `storage` or `net`.
    pub plugin: String,

    /// Plugin location string (for `net`: `host:port`).
    #[serde(default)]
    pub location: String,

    /// Sampling schedule.
    #[serde(flatten)]
    pub policy: PolicyDef,
}

/// Binds one observed port to a view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservableDef {
    /// Dot-separated path of the atomic model from the root.
    pub model: String,
    /// Observed port or state-variable name.
    pub port: String,
    /// Receiving view.
    pub view: String,
}

/// A complete project description.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Project {
    /// The experiment frame.
    #[serde(default)]
    pub experiment: Experiment,

    /// The root coupled model.
    pub model: ModelDef,

    /// Observation views.
    #[serde(default)]
    pub views: Vec<ViewDef>,

    /// Observable-to-view bindings.
    #[serde(default)]
    pub observables: Vec<ObservableDef>,
}

impl Project {
    /// Creates a project around a root model definition.
    pub fn new(model: ModelDef) -> Self {
        Self {
            experiment: Experiment::default(),
            model,
            views: Vec::new(),
            observables: Vec::new(),
        }
    }

    /// Loads a project from a YAML string.
    pub fn from_yaml(yaml: &str) -> ProjectResult<Self> {
        let project: Project = serde_yaml::from_str(yaml)?;
        project.validate()?;
        Ok(project)
    }

    /// Loads a project from a JSON string.
    pub fn from_json(json: &str) -> ProjectResult<Self> {
        let project: Project = serde_json::from_str(json)?;
        project.validate()?;
        Ok(project)
    }

    /// Loads a project from a file, format detected by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ProjectResult<Self> {
        let path = path.as_ref();
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content = std::fs::read_to_string(path)?;
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ProjectError::UnknownFormat(ext.to_string())),
        }
    }

    /// Serializes to YAML.
    pub fn to_yaml(&self) -> ProjectResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Serializes to pretty JSON.
    pub fn to_json(&self) -> ProjectResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Sets the experiment frame.
    pub fn with_experiment(mut self, experiment: Experiment) -> Self {
        self.experiment = experiment;
        self
    }

    /// Adds a view definition.
    pub fn with_view(mut self, view: ViewDef) -> Self {
        self.views.push(view);
        self
    }

    /// Binds an observable to a view.
    pub fn with_observable(
        mut self,
        model: impl Into<String>,
        port: impl Into<String>,
        view: impl Into<String>,
    ) -> Self {
        self.observables.push(ObservableDef {
            model: model.into(),
            port: port.into(),
            view: view.into(),
        });
        self
    }

    /// Validates the whole description.
    pub fn validate(&self) -> ProjectResult<()> {
        if !self.experiment.duration.is_finite() || self.experiment.duration < 0.0 {
            return Err(ProjectError::Validation(format!(
                "experiment duration {} is not a finite non-negative value",
                self.experiment.duration
            )));
        }
        if !self.experiment.begin.is_finite() || self.experiment.begin < 0.0 {
            return Err(ProjectError::Validation(format!(
                "experiment begin {} is not a finite non-negative value",
                self.experiment.begin
            )));
        }
        if self.model.kind != ModelKindDef::Coupled {
            return Err(ProjectError::Validation(
                "the root model must be coupled".to_string(),
            ));
        }
        self.model.validate("")?;

        let mut view_names = HashSet::new();
        for view in &self.views {
            if !view_names.insert(view.name.as_str()) {
                return Err(ProjectError::Validation(format!(
                    "duplicate view `{}`",
                    view.name
                )));
            }
            if let PolicyDef::Timed { step } = view.policy {
                if !step.is_finite() || step <= 0.0 {
                    return Err(ProjectError::Validation(format!(
                        "view `{}` has a non-positive sampling step",
                        view.name
                    )));
                }
            }
        }

        for observable in &self.observables {
            if !view_names.contains(observable.view.as_str()) {
                return Err(ProjectError::Validation(format!(
                    "observable `{}:{}` references unknown view `{}`",
                    observable.model, observable.port, observable.view
                )));
            }
            if self.resolve(&observable.model).is_none() {
                return Err(ProjectError::Validation(format!(
                    "observable references unknown model `{}`",
                    observable.model
                )));
            }
        }
        Ok(())
    }

    /// Resolves a dot-separated model path inside the description.
    pub fn resolve(&self, path: &str) -> Option<&ModelDef> {
        let mut parts = path.split('.');
        if parts.next()? != self.model.name {
            return None;
        }
        let mut cursor = &self.model;
        for part in parts {
            cursor = cursor.submodels.iter().find(|m| m.name == part)?;
        }
        Some(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_project() -> Project {
        Project::new(
            ModelDef::coupled("top")
                .with_submodel(
                    ModelDef::atomic("gen", "generator")
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
        .with_observable("top.sink", "count", "main")
    }

    #[test]
    fn test_builder_validates() {
        tiny_project().validate().unwrap();
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
experiment:
  name: demo
  duration: 10.0
  seed: 7

model:
  name: top
  type: coupled
  submodels:
    - name: gen
      type: atomic
      dynamics: generator
      outputs: [out]
    - name: sink
      type: atomic
      dynamics: counter
      inputs: [in]
  connections:
    - type: internal
      origin: { model: gen, port: out }
      destination: { model: sink, port: in }

views:
  - name: main
    plugin: storage
    policy: each_step

observables:
  - model: top.sink
    port: count
    view: main
"#;
        let project = Project::from_yaml(yaml).unwrap();
        assert_eq!(project.experiment.duration, 10.0);
        assert_eq!(project.experiment.seed, 7);
        assert_eq!(project.model.submodels.len(), 2);
        assert_eq!(project.views.len(), 1);
        assert!(project.resolve("top.gen").is_some());
    }

    #[test]
    fn test_json_roundtrip() {
        let project = tiny_project();
        let json = project.to_json().unwrap();
        let restored = Project::from_json(&json).unwrap();
        assert_eq!(restored.model.submodels.len(), 2);
        assert_eq!(restored.observables, project.observables);
    }

    #[test]
    fn test_duplicate_submodel_rejected() {
        let project = Project::new(
            ModelDef::coupled("top")
                .with_submodel(ModelDef::atomic("a", "x"))
                .with_submodel(ModelDef::atomic("a", "y")),
        );
        assert!(matches!(
            project.validate(),
            Err(ProjectError::Validation(_))
        ));
    }

    #[test]
    fn test_connection_to_missing_port_rejected() {
        let project = Project::new(
            ModelDef::coupled("top")
                .with_submodel(ModelDef::atomic("a", "x").with_output("out"))
                .with_submodel(ModelDef::atomic("b", "y"))
                .with_internal_connection("a", "out", "b", "in"),
        );
        assert!(matches!(
            project.validate(),
            Err(ProjectError::Validation(_))
        ));
    }

    #[test]
    fn test_atomic_without_dynamics_rejected() {
        let mut def = ModelDef::atomic("a", "x");
        def.dynamics = None;
        let project = Project::new(ModelDef::coupled("top").with_submodel(def));
        assert!(matches!(
            project.validate(),
            Err(ProjectError::Validation(_))
        ));
    }

    #[test]
    fn test_observable_unknown_view_rejected() {
        let project = Project::new(
            ModelDef::coupled("top").with_submodel(ModelDef::atomic("a", "x")),
        )
        .with_observable("top.a", "state", "nope");
        assert!(matches!(
            project.validate(),
            Err(ProjectError::Validation(_))
        ));
    }

    #[test]
    fn test_timed_policy_needs_positive_step() {
        let project = Project::new(ModelDef::coupled("top")).with_view(ViewDef {
            name: "v".into(),
            plugin: "storage".into(),
            location: String::new(),
            policy: PolicyDef::Timed { step: 0.0 },
        });
        assert!(matches!(
            project.validate(),
            Err(ProjectError::Validation(_))
        ));
    }
}
