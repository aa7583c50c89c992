//! In-memory storage of view samples.
//!
//! The storage plugin accumulates a view matrix: one column per observable
//! (identified by the concatenated parent path and simulator name, plus the
//! port) and one row per distinct sample time. Null samples are skipped.

use std::collections::HashMap;

use super::plugin::ViewPlugin;
use super::trame::ModelSample;
use crate::value::{Table, Value};

/// Identity of one column of the matrix.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ColumnKey {
    /// Concatenation of the parent path and the simulator name.
    pub name: String,
    /// The observed port.
    pub port: String,
}

/// A plugin that builds the view matrix in memory.
#[derive(Default)]
pub struct StoragePlugin {
    columns: Vec<ColumnKey>,
    index: HashMap<ColumnKey, usize>,
    times: Vec<f64>,
    rows: Vec<Vec<Value>>,
    current: Option<f64>,
    last_time: Option<f64>,
}

impl StoragePlugin {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of completed and in-progress rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The column keys, in registration order.
    pub fn columns(&self) -> &[ColumnKey] {
        &self.columns
    }

    /// The sample times, one per row.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// The final time stamped by the `end` trame, if the stream closed.
    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// The value at `(column, row)`; null when never written.
    pub fn get(&self, column: usize, row: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(column))
    }

    /// Looks up a column index by its identity.
    pub fn column_index(&self, name: &str, port: &str) -> Option<usize> {
        self.index
            .get(&ColumnKey {
                name: name.to_string(),
                port: port.to_string(),
            })
            .copied()
    }

    /// Renders the matrix as a [`Value::Table`] with a leading time column.
    pub fn to_table(&self) -> Value {
        let mut table = Table::new(self.columns.len() + 1, 0);
        for (row_idx, row) in self.rows.iter().enumerate() {
            let mut cells = Vec::with_capacity(row.len() + 1);
            cells.push(Value::Double(self.times[row_idx]));
            cells.extend(row.iter().cloned());
            table.push_row(cells);
        }
        Value::Table(table)
    }

    fn open_row(&mut self, time: f64) {
        self.times.push(time);
        self.rows.push(vec![Value::Null; self.columns.len()]);
        self.current = Some(time);
    }
}

impl ViewPlugin for StoragePlugin {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn on_parameter(&mut self, _view: &str, data: &str) {
        // The setup string optionally carries "columns rows" sizing hints.
        let mut parts = data.split_whitespace();
        let columns: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let rows: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        self.columns.reserve(columns);
        self.times.reserve(rows);
        self.rows.reserve(rows);
    }

    fn on_new_observable(&mut self, _view: &str, parent: &str, simulator: &str, port: &str) {
        let key = ColumnKey {
            name: format!("{parent}{simulator}"),
            port: port.to_string(),
        };
        if self.index.contains_key(&key) {
            return;
        }
        self.index.insert(key.clone(), self.columns.len());
        self.columns.push(key);
        for row in &mut self.rows {
            row.push(Value::Null);
        }
    }

    fn on_del_observable(&mut self, _view: &str, parent: &str, simulator: &str, port: &str) {
        // Columns are kept so earlier rows stay addressable; the column
        // simply stops receiving samples.
        let _ = (parent, simulator, port);
    }

    fn on_value(&mut self, _view: &str, time: f64, items: &[ModelSample]) {
        if self.current != Some(time) {
            self.open_row(time);
        }
        for item in items {
            if item.value.is_null() {
                continue;
            }
            let key = ColumnKey {
                name: format!("{}{}", item.parent, item.simulator),
                port: item.port.clone(),
            };
            if let Some(&column) = self.index.get(&key) {
                if let Some(row) = self.rows.last_mut() {
                    row[column] = item.value.clone();
                }
            }
        }
    }

    fn close(&mut self, _view: &str, time: f64) {
        self.last_time = Some(time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(parent: &str, simulator: &str, port: &str, value: Value) -> ModelSample {
        ModelSample {
            parent: parent.to_string(),
            simulator: simulator.to_string(),
            port: port.to_string(),
            value,
        }
    }

    #[test]
    fn test_columns_and_rows() {
        let mut storage = StoragePlugin::new();
        storage.on_new_observable("v", "top.", "a", "out");
        storage.on_new_observable("v", "top.", "b", "out");
        assert_eq!(storage.column_count(), 2);

        storage.on_value("v", 0.0, &[sample("top.", "a", "out", Value::Integer(1))]);
        storage.on_value(
            "v",
            1.0,
            &[
                sample("top.", "a", "out", Value::Integer(2)),
                sample("top.", "b", "out", Value::Integer(3)),
            ],
        );

        assert_eq!(storage.row_count(), 2);
        assert_eq!(storage.times(), &[0.0, 1.0]);

        let a = storage.column_index("top.a", "out").unwrap();
        let b = storage.column_index("top.b", "out").unwrap();
        assert_eq!(storage.get(a, 0), Some(&Value::Integer(1)));
        assert_eq!(storage.get(b, 0), Some(&Value::Null));
        assert_eq!(storage.get(b, 1), Some(&Value::Integer(3)));
    }

    #[test]
    fn test_same_time_batches_share_a_row() {
        let mut storage = StoragePlugin::new();
        storage.on_new_observable("v", "", "a", "x");
        storage.on_new_observable("v", "", "a", "y");

        storage.on_value("v", 2.0, &[sample("", "a", "x", Value::Integer(1))]);
        storage.on_value("v", 2.0, &[sample("", "a", "y", Value::Integer(2))]);
        assert_eq!(storage.row_count(), 1);

        let x = storage.column_index("a", "x").unwrap();
        let y = storage.column_index("a", "y").unwrap();
        assert_eq!(storage.get(x, 0), Some(&Value::Integer(1)));
        assert_eq!(storage.get(y, 0), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_null_samples_are_skipped() {
        let mut storage = StoragePlugin::new();
        storage.on_new_observable("v", "", "a", "x");
        storage.on_value("v", 0.0, &[sample("", "a", "x", Value::Null)]);

        let x = storage.column_index("a", "x").unwrap();
        assert_eq!(storage.get(x, 0), Some(&Value::Null));
    }

    #[test]
    fn test_close_stamps_last_time() {
        let mut storage = StoragePlugin::new();
        storage.close("v", 9.0);
        assert_eq!(storage.last_time(), Some(9.0));
    }

    #[test]
    fn test_to_table_has_time_column() {
        let mut storage = StoragePlugin::new();
        storage.on_new_observable("v", "", "a", "x");
        storage.on_value("v", 1.5, &[sample("", "a", "x", Value::Integer(4))]);

        let table = storage.to_table();
        let table = table.as_table().unwrap();
        assert_eq!(table.columns(), 2);
        assert_eq!(table.rows(), 1);
        assert_eq!(table.get(0, 0), Some(&Value::Double(1.5)));
        assert_eq!(table.get(1, 0), Some(&Value::Integer(4)));
    }
}
