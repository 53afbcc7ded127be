//! Result Value Store: named results of earlier calls
//!
//! Each proxy owns one store, and one more belongs to the client session for
//! static calls. Back-reference arguments are resolved against exactly one
//! store at call-build time, so bindings never leak across scopes.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{Result, VrpcError};
use crate::value::{Arg, Value};

#[derive(Debug, Default)]
pub struct ValueStore {
    values: RwLock<HashMap<String, Value>>,
}

impl ValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite a binding
    pub fn bind(&self, name: impl Into<String>, value: Value) {
        self.values
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.into(), value);
    }

    /// Currently bound value
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Resolve one argument: literals pass through, references are looked up
    pub fn resolve(&self, arg: &Arg) -> Result<Value> {
        match arg {
            Arg::Literal(value) => Ok(value.clone()),
            Arg::Reference(name) => self
                .get(name)
                .ok_or_else(|| VrpcError::UnresolvedReference(name.clone())),
        }
    }

    /// Resolve an argument list; fails on the first unbound reference
    pub fn resolve_all(&self, args: &[Arg]) -> Result<Vec<Value>> {
        args.iter().map(|arg| self.resolve(arg)).collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.values.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
