use serde::Serialize;
use serde_json::{Map, Value};

/// One result row, decoded into JSON values
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Single anonymous column, the shape of `SELECT <expr>`
    pub fn single(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(vec![column.into()], vec![value.into()])
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|name| name == column)
            .and_then(|index| self.values.get(index))
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// `{column: value, ..}`; later duplicate column names win
    pub fn to_json(&self) -> Value {
        let object: Map<String, Value> = self
            .columns
            .iter()
            .cloned()
            .zip(self.values.iter().cloned())
            .collect();
        Value::Object(object)
    }
}
