//! Positional call parameters.

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use super::DispatchError;

/// Positional parameters of one call, after credentials were taken out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params(Vec<JsonValue>);

impl Params {
    pub fn new(values: Vec<JsonValue>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<JsonValue> {
        self.0
    }

    /// Required argument at `index`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, DispatchError> {
        let value = self
            .0
            .get(index)
            .ok_or_else(|| DispatchError::InvalidParams(format!("missing argument {name}")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| DispatchError::InvalidParams(format!("argument {name}: {e}")))
    }

    /// Optional argument at `index`; absent and `null` both yield `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, DispatchError> {
        match self.0.get(index) {
            None | Some(JsonValue::Null) => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }

    /// Remove and return the first param if it is a string accepted by `accept`.
    ///
    /// Params are left untouched otherwise.
    pub(crate) fn take_leading_string_if(&mut self, accept: impl FnOnce(&str) -> bool) -> Option<String> {
        match self.0.first() {
            Some(JsonValue::String(s)) if accept(s) => match self.0.remove(0) {
                JsonValue::String(s) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Vec<JsonValue>> for Params {
    fn from(values: Vec<JsonValue>) -> Self {
        Self(values)
    }
}
