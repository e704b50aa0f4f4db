// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declarative argument checking for RPC methods.
//!
//! Each method declares a [`Schema`]; parsing a request's parameter map
//! rejects unknown keys, reports the first missing required key, validates
//! types and fills in defaults. Integer arguments are accepted both as JSON
//! numbers and as numeric strings, since GET and multipart requests carry
//! everything as text.
//!
//! ```ignore
//! let args = Schema::new()
//!     .required("volumeName", Check::String)
//!     .optional("delay", Check::NonNegInt, 0)
//!     .parse(&params)?;
//! let name = args.str("volumeName")?;
//! ```

use serde_json::{Map, Value};

use crate::error::{ManagerError, Result};
use crate::node::RoleCounts;

/// Flat parameter map of one RPC call.
pub type Params = Map<String, Value>;

/// Validation applied to one argument.
#[derive(Debug, Clone)]
pub enum Check {
    /// Any JSON value.
    Any,
    /// A string.
    String,
    /// An integer greater than zero.
    PosInt,
    /// An integer greater than or equal to zero.
    NonNegInt,
    /// A boolean, or the strings `true`/`false`.
    Bool,
    /// A JSON object.
    Dict,
    /// A `{role: count}` object with non-negative counts.
    RoleCounts,
    /// A list of JSON objects.
    ListOfDicts,
    /// A string from the given set.
    OneOf(Vec<String>),
    /// A string not in the given set.
    NotIn(Vec<String>),
}

#[derive(Debug, Clone)]
struct ArgSpec {
    name: &'static str,
    check: Check,
    default: Option<Value>,
}

/// Declared arguments of one method.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    args: Vec<ArgSpec>,
}

impl Schema {
    /// Schema accepting no arguments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required argument.
    pub fn required(mut self, name: &'static str, check: Check) -> Self {
        self.args.push(ArgSpec {
            name,
            check,
            default: None,
        });
        self
    }

    /// Add an optional argument. A `Value::Null` default leaves it absent.
    pub fn optional(mut self, name: &'static str, check: Check, default: impl Into<Value>) -> Self {
        self.args.push(ArgSpec {
            name,
            check,
            default: Some(default.into()),
        });
        self
    }

    /// Validate `params` and return normalized arguments.
    pub fn parse(&self, params: &Params) -> Result<Args> {
        let mut unexpected: Vec<String> = params
            .keys()
            .filter(|k| !self.args.iter().any(|a| a.name == k.as_str()))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            unexpected.sort();
            return Err(ManagerError::ArgsUnexpected(unexpected));
        }

        let mut out = Params::new();
        for arg in &self.args {
            match params.get(arg.name) {
                Some(value) => {
                    let normalized = validate(arg.name, &arg.check, value)?;
                    out.insert(arg.name.to_string(), normalized);
                }
                None => match &arg.default {
                    None => return Err(ManagerError::ArgsMissing(arg.name.to_string())),
                    Some(Value::Null) => {}
                    Some(default) => {
                        out.insert(arg.name.to_string(), default.clone());
                    }
                },
            }
        }
        Ok(Args(out))
    }
}

fn invalid(name: &str, reason: impl std::fmt::Display) -> ManagerError {
    ManagerError::invalid(format!("{}: {}", name, reason))
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn validate(name: &str, check: &Check, value: &Value) -> Result<Value> {
    match check {
        Check::Any => Ok(value.clone()),
        Check::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(invalid(name, "expected a string")),
        },
        Check::PosInt => match as_integer(value) {
            Some(n) if n > 0 => Ok(Value::from(n)),
            _ => Err(invalid(name, "expected a positive integer")),
        },
        Check::NonNegInt => match as_integer(value) {
            Some(n) if n >= 0 => Ok(Value::from(n)),
            _ => Err(invalid(name, "expected a non-negative integer")),
        },
        Check::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s == "true" || s == "false" => Ok(Value::Bool(s == "true")),
            _ => Err(invalid(name, "expected a boolean")),
        },
        Check::Dict => match value {
            Value::Object(_) => Ok(value.clone()),
            _ => Err(invalid(name, "expected a dictionary")),
        },
        Check::RoleCounts => {
            let Value::Object(map) = value else {
                return Err(invalid(name, "expected a {role: count} dictionary"));
            };
            let mut normalized = Map::new();
            for (role, count) in map {
                match as_integer(count) {
                    Some(n) if u32::try_from(n).is_ok() => {
                        normalized.insert(role.clone(), Value::from(n));
                    }
                    _ => return Err(invalid(name, format!("bad count for role '{}'", role))),
                }
            }
            Ok(Value::Object(normalized))
        }
        Check::ListOfDicts => match value {
            Value::Array(items) if items.iter().all(Value::is_object) => Ok(value.clone()),
            _ => Err(invalid(name, "expected a list of dictionaries")),
        },
        Check::OneOf(allowed) => match value.as_str() {
            Some(s) if allowed.iter().any(|a| a == s) => Ok(value.clone()),
            _ => Err(invalid(
                name,
                format!("expected one of [{}]", allowed.join(", ")),
            )),
        },
        Check::NotIn(taken) => match value.as_str() {
            Some(s) if taken.iter().any(|t| t == s) => {
                Err(invalid(name, format!("'{}' already exists", s)))
            }
            Some(_) => Ok(value.clone()),
            None => Err(invalid(name, "expected a string")),
        },
    }
}

/// Arguments that passed a [`Schema`].
#[derive(Debug, Clone, Default)]
pub struct Args(Params);

impl Args {
    /// Raw value of an argument.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Whether the argument is present after defaults.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// String argument.
    pub fn str(&self, name: &str) -> Result<&str> {
        self.0
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| ManagerError::ArgsMissing(name.to_string()))
    }

    /// Optional string argument.
    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Integer argument.
    pub fn int(&self, name: &str) -> Result<i64> {
        self.0
            .get(name)
            .and_then(as_integer)
            .ok_or_else(|| ManagerError::ArgsMissing(name.to_string()))
    }

    /// Non-negative integer argument.
    pub fn u64(&self, name: &str) -> Result<u64> {
        let n = self.int(name)?;
        u64::try_from(n).map_err(|_| invalid(name, "expected a non-negative integer"))
    }

    /// Boolean argument.
    pub fn bool(&self, name: &str) -> Result<bool> {
        self.0
            .get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| ManagerError::ArgsMissing(name.to_string()))
    }

    /// List argument.
    pub fn list(&self, name: &str) -> Result<&Vec<Value>> {
        self.0
            .get(name)
            .and_then(Value::as_array)
            .ok_or_else(|| ManagerError::ArgsMissing(name.to_string()))
    }

    /// `{role: count}` argument checked with [`Check::RoleCounts`].
    pub fn role_counts(&self, name: &str) -> Result<RoleCounts> {
        let map = self
            .0
            .get(name)
            .and_then(Value::as_object)
            .ok_or_else(|| ManagerError::ArgsMissing(name.to_string()))?;
        let pairs = map
            .iter()
            .map(|(role, count)| {
                count
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .map(|n| (role.clone(), n))
                    .ok_or_else(|| invalid(name, format!("bad count for role '{}'", role)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RoleCounts::new(pairs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_required_argument() {
        let schema = Schema::new().required("cloud", Check::String);
        let err = schema.parse(&Params::new()).unwrap_err();
        assert!(matches!(err, ManagerError::ArgsMissing(ref n) if n == "cloud"));
    }

    #[test]
    fn test_unexpected_arguments_are_reported_sorted() {
        let schema = Schema::new().required("cloud", Check::String);
        let err = schema
            .parse(&params(json!({"cloud": "c", "zeta": 1, "alpha": 2})))
            .unwrap_err();
        match err {
            ManagerError::ArgsUnexpected(keys) => assert_eq!(keys, vec!["alpha", "zeta"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_defaults_are_filled() {
        let schema = Schema::new()
            .optional("cloud", Check::String, "default")
            .optional("filename", Check::String, Value::Null);
        let args = schema.parse(&Params::new()).unwrap();
        assert_eq!(args.str("cloud").unwrap(), "default");
        assert!(!args.contains("filename"));
    }

    #[test]
    fn test_integers_accept_numeric_strings() {
        let schema = Schema::new()
            .required("size", Check::PosInt)
            .required("delay", Check::NonNegInt);
        let args = schema
            .parse(&params(json!({"size": "512", "delay": 0})))
            .unwrap();
        assert_eq!(args.u64("size").unwrap(), 512);
        assert_eq!(args.u64("delay").unwrap(), 0);

        let err = schema
            .parse(&params(json!({"size": 0, "delay": 0})))
            .unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");
    }

    #[test]
    fn test_role_counts_are_normalized_in_order() {
        let schema = Schema::new().required("nodes", Check::RoleCounts);
        let args = schema
            .parse(&params(json!({"nodes": {"mysql": "2", "glb": 1}})))
            .unwrap();
        let counts = args.role_counts("nodes").unwrap();
        assert_eq!(counts.expand(), vec!["mysql", "mysql", "glb"]);

        let err = schema
            .parse(&params(json!({"nodes": {"mysql": -1}})))
            .unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");

        let err = schema
            .parse(&params(json!({"nodes": {"glb": 4294967296u64}})))
            .unwrap_err();
        assert_eq!(err.error_code(), "E_ARGS_INVALID");
    }

    #[test]
    fn test_one_of_and_not_in() {
        let schema = Schema::new()
            .required("command", Check::OneOf(vec!["run".into(), "cleanup".into()]))
            .required("volumeName", Check::NotIn(vec!["taken".into()]));
        assert!(
            schema
                .parse(&params(json!({"command": "run", "volumeName": "free"})))
                .is_ok()
        );
        assert!(
            schema
                .parse(&params(json!({"command": "stop", "volumeName": "free"})))
                .is_err()
        );
        let err = schema
            .parse(&params(json!({"command": "run", "volumeName": "taken"})))
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
