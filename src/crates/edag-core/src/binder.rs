//! Parameter binding for node units
//!
//! Rust closures carry no runtime parameter names, so every unit declares its
//! shape with a [`Signature`]: ordered parameter names, optional defaults and
//! whether the unit accepts an open-ended set of named inputs.
//!
//! Binding is deliberately partial. [`Signature::bind`] never fails because a
//! required parameter is absent; [`Signature::check`] reports that at the
//! moment the unit is actually invoked. This is how a value hidden by
//! restricted visibility surfaces as a [`BindingError::Missing`].
//!
//! ```rust
//! use edag_core::binder::Signature;
//! use serde_json::{json, Map};
//!
//! let sig = Signature::new(["a", "b"]).with_default("b", json!(10));
//!
//! let mut named = Map::new();
//! named.insert("a".to_string(), json!(1));
//! named.insert("unrelated".to_string(), json!(true));
//!
//! let args = sig.bind(Vec::new(), named).unwrap();
//! assert_eq!(args.get("b"), Some(&json!(10)));
//! assert!(args.get("unrelated").is_none());
//! assert!(sig.check(&args).is_ok());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Named argument set passed to a unit.
pub type Arguments = Map<String, Value>;

/// Errors raised while binding inputs to a [`Signature`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingError {
    /// Required parameters had no supplied value and no default
    #[error("missing required parameter(s): {}", params.join(", "))]
    Missing { params: Vec<String> },

    /// More positional inputs than declared parameters
    #[error("expected at most {expected} positional input(s), got {got}")]
    TooManyPositional { expected: usize, got: usize },

    /// A parameter was supplied both positionally and by name
    #[error("parameter '{param}' supplied more than once")]
    Duplicate { param: String },
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }

    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// Declared parameter shape of a unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub params: Vec<Param>,
    /// Whether undeclared named inputs are passed through instead of dropped
    #[serde(default)]
    pub accepts_extra: bool,
}

impl Signature {
    /// Signature with the given required parameters, in order.
    pub fn new<I, S>(params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params: params.into_iter().map(Param::required).collect(),
            accepts_extra: false,
        }
    }

    /// Signature taking no declared parameters and every named input.
    pub fn variadic() -> Self {
        Self {
            params: Vec::new(),
            accepts_extra: true,
        }
    }

    /// Give `name` a default, declaring it if it was not declared yet.
    pub fn with_default(mut self, name: &str, default: Value) -> Self {
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(param) => param.default = Some(default),
            None => self.params.push(Param::optional(name, default)),
        }
        self
    }

    pub fn with_extra(mut self) -> Self {
        self.accepts_extra = true;
        self
    }

    pub fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Bind positional and named inputs, partially, then apply defaults.
    pub fn bind(
        &self,
        positional: Vec<Value>,
        named: Arguments,
    ) -> Result<Arguments, BindingError> {
        if positional.len() > self.params.len() {
            return Err(BindingError::TooManyPositional {
                expected: self.params.len(),
                got: positional.len(),
            });
        }

        let mut bound = Arguments::new();
        for (param, value) in self.params.iter().zip(positional) {
            bound.insert(param.name.clone(), value);
        }

        for (name, value) in named {
            if !self.accepts_extra && !self.declares(&name) {
                continue;
            }
            if bound.contains_key(&name) {
                return Err(BindingError::Duplicate { param: name });
            }
            bound.insert(name, value);
        }

        for param in &self.params {
            if bound.contains_key(&param.name) {
                continue;
            }
            if let Some(default) = &param.default {
                bound.insert(param.name.clone(), default.clone());
            }
        }

        Ok(bound)
    }

    /// Verify every required parameter is bound.
    pub fn check(&self, arguments: &Arguments) -> Result<(), BindingError> {
        let missing: Vec<String> = self
            .params
            .iter()
            .filter(|p| p.is_required() && !arguments.contains_key(&p.name))
            .map(|p| p.name.clone())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(BindingError::Missing { params: missing })
        }
    }
}
