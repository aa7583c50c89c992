//! Observation plug-ins.
//!
//! A [`ViewPlugin`] consumes the trame stream of one view: setup, column
//! management, timestamped samples, and the end-of-stream mark. The
//! provided [`deliver`](ViewPlugin::deliver) dispatcher unpacks trames onto
//! the five handlers, so a plugin only implements what it cares about.

use std::sync::Arc;

use parking_lot::Mutex;

use super::trame::{ModelSample, ProtocolError, Trame};

/// Consumer of one view's trame stream.
pub trait ViewPlugin: Send {
    /// A short identifier used in logs.
    fn name(&self) -> &'static str;

    /// View setup parameter (the project's location string).
    fn on_parameter(&mut self, view: &str, data: &str) {
        let _ = (view, data);
    }

    /// A column identified by `(parent, simulator, port)` joins the view.
    fn on_new_observable(&mut self, view: &str, parent: &str, simulator: &str, port: &str) {
        let _ = (view, parent, simulator, port);
    }

    /// A column leaves the view.
    fn on_del_observable(&mut self, view: &str, parent: &str, simulator: &str, port: &str) {
        let _ = (view, parent, simulator, port);
    }

    /// A timestamped batch of samples.
    fn on_value(&mut self, view: &str, time: f64, items: &[ModelSample]) {
        let _ = (view, time, items);
    }

    /// End of the stream; the last timestamp of the run.
    fn close(&mut self, view: &str, time: f64) {
        let _ = (view, time);
    }

    /// Dispatches a trame onto the handlers above.
    fn deliver(&mut self, trame: &Trame) {
        match trame {
            Trame::Parameter { view, data } => self.on_parameter(view, data),
            Trame::NewObservable {
                view,
                parent,
                simulator,
                port,
            } => self.on_new_observable(view, parent, simulator, port),
            Trame::DelObservable {
                view,
                parent,
                simulator,
                port,
            } => self.on_del_observable(view, parent, simulator, port),
            Trame::Value { view, time, items } => self.on_value(view, *time, items),
            Trame::End { view, time } => self.close(view, *time),
        }
    }
}

/// Adapter from a plugin to a [`TrameSink`](super::TrameSink).
pub struct PluginSink<P: ViewPlugin> {
    plugin: P,
}

impl<P: ViewPlugin> PluginSink<P> {
    /// Wraps `plugin` as a synchronous in-process sink.
    pub fn new(plugin: P) -> Self {
        Self { plugin }
    }

    /// The wrapped plugin.
    pub fn plugin(&self) -> &P {
        &self.plugin
    }
}

impl<P: ViewPlugin> super::TrameSink for PluginSink<P> {
    fn deliver(&mut self, trame: &Trame) -> Result<(), ProtocolError> {
        self.plugin.deliver(trame);
        Ok(())
    }
}

/// A plugin handle shared between the coordinator-side sink and the caller.
///
/// The root coordinator keeps one clone to read results back after the run
/// while the view owns the other inside its sink.
pub struct SharedPlugin<P: ViewPlugin> {
    inner: Arc<Mutex<P>>,
}

impl<P: ViewPlugin> SharedPlugin<P> {
    /// Wraps `plugin` behind a lock.
    pub fn new(plugin: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(plugin)),
        }
    }

    /// Runs `f` with the locked plugin.
    pub fn with<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.inner.lock())
    }
}

impl<P: ViewPlugin> Clone for SharedPlugin<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: ViewPlugin> ViewPlugin for SharedPlugin<P> {
    fn name(&self) -> &'static str {
        "shared"
    }

    fn deliver(&mut self, trame: &Trame) {
        self.inner.lock().deliver(trame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[derive(Default)]
    struct Recorder {
        parameters: usize,
        columns: usize,
        samples: usize,
        closed: bool,
    }

    impl ViewPlugin for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn on_parameter(&mut self, _view: &str, _data: &str) {
            self.parameters += 1;
        }

        fn on_new_observable(&mut self, _v: &str, _p: &str, _s: &str, _port: &str) {
            self.columns += 1;
        }

        fn on_value(&mut self, _view: &str, _time: f64, items: &[ModelSample]) {
            self.samples += items.len();
        }

        fn close(&mut self, _view: &str, _time: f64) {
            self.closed = true;
        }
    }

    #[test]
    fn test_deliver_dispatches() {
        let mut plugin = Recorder::default();
        plugin.deliver(&Trame::Parameter {
            view: "v".into(),
            data: String::new(),
        });
        plugin.deliver(&Trame::NewObservable {
            view: "v".into(),
            parent: "top".into(),
            simulator: "a".into(),
            port: "out".into(),
        });
        plugin.deliver(&Trame::Value {
            view: "v".into(),
            time: 1.0,
            items: vec![ModelSample {
                parent: "top".into(),
                simulator: "a".into(),
                port: "out".into(),
                value: Value::Integer(1),
            }],
        });
        plugin.deliver(&Trame::End {
            view: "v".into(),
            time: 1.0,
        });

        assert_eq!(plugin.parameters, 1);
        assert_eq!(plugin.columns, 1);
        assert_eq!(plugin.samples, 1);
        assert!(plugin.closed);
    }

    #[test]
    fn test_shared_plugin_sees_deliveries_from_clone() {
        let shared = SharedPlugin::new(Recorder::default());
        let mut writer = shared.clone();
        writer.deliver(&Trame::End {
            view: "v".into(),
            time: 2.0,
        });
        assert!(shared.with(|p| p.closed));
    }
}
