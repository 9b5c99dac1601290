//! Call arguments: positional list plus named map

use crate::error::ValueError;
use crate::value::{FromValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Arguments of a method call or stream event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    pub fn with(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a named argument
    pub fn named(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named_values(&self) -> &BTreeMap<String, Value> {
        &self.named
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Typed positional argument; absent index is an error
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, ValueError> {
        let value = self
            .positional
            .get(index)
            .ok_or(ValueError::MissingArgument {
                index,
                available: self.positional.len(),
            })?;
        T::from_value(value)
    }

    /// Typed positional argument with a fallback for absent or nil values
    pub fn get_or<T: FromValue>(&self, index: usize, default: T) -> Result<T, ValueError> {
        match self.positional.get(index) {
            None | Some(Value::Nil) => Ok(default),
            Some(value) => T::from_value(value),
        }
    }

    /// Typed named argument
    pub fn kwarg<T: FromValue>(&self, key: &str) -> Result<Option<T>, ValueError> {
        self.named.get(key).map(T::from_value).transpose()
    }

    /// Typed named argument that must be present
    pub fn require<T: FromValue>(&self, key: &str) -> Result<T, ValueError> {
        self.kwarg(key)?.ok_or_else(|| ValueError::MissingNamed {
            key: key.to_string(),
        })
    }
}

impl<T: Into<Value>> FromIterator<T> for Args {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            positional: iter.into_iter().map(Into::into).collect(),
            named: BTreeMap::new(),
        }
    }
}

impl From<Vec<Value>> for Args {
    fn from(positional: Vec<Value>) -> Self {
        Self {
            positional,
            named: BTreeMap::new(),
        }
    }
}

/// Build positional [`Args`]: `args!["db", 3, true]`
#[macro_export]
macro_rules! args {
    () => {
        $crate::Args::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::Args::new()$(.with($value))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_and_named_access() {
        let args = Args::new().with("BTC").with(3).named("limit", 2.5);

        assert_eq!(args.len(), 1 + 1);
        assert_eq!(args.get::<String>(0).unwrap(), "BTC");
        assert_eq!(args.get::<i64>(1).unwrap(), 3);
        assert_eq!(args.kwarg::<f64>("limit").unwrap(), Some(2.5));
        assert_eq!(args.kwarg::<f64>("absent").unwrap(), None);
    }

    #[test]
    fn test_missing_argument_is_reported() {
        let args = Args::new();
        assert_eq!(
            args.get::<i64>(0),
            Err(ValueError::MissingArgument {
                index: 0,
                available: 0
            })
        );
        assert_eq!(args.get_or::<i64>(0, 9).unwrap(), 9);
        assert!(matches!(
            args.require::<String>("table"),
            Err(ValueError::MissingNamed { .. })
        ));
    }

    #[test]
    fn test_args_macro() {
        let args = crate::args!["x", 1];
        assert_eq!(args.positional(), &[Value::from("x"), Value::Int(1)]);
        assert!(crate::args![].is_empty());
    }
}
