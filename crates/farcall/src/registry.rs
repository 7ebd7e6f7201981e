//! Call registry: named invocable targets and the flat dispatch table.
//!
//! Hosts export plain callables (`register_value`/`register_raw`/
//! `register_image`) or objects with a listed set of methods
//! ([`ObjectExport`]). `rebuild()` recomputes the flat name → callable table
//! from the current registrations and publishes it atomically; the serve
//! loop only ever reads a published table, so it never observes a
//! half-updated one.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_util::bytes::Bytes;

use crate::wire::envelope::{Fault, Reply};
use crate::wire::image::ImageFrame;

/// Built-in helper that lists every registered call name. Checked before the
/// user table, so it cannot be shadowed.
pub const LIST_CALLS: &str = "list-calls";

/// Error a target reports back to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The request's params did not bind against the target's parameters.
    #[error("{0}")]
    BadParams(String),

    /// The target failed while executing.
    #[error("{0}")]
    Fault(String),
}

impl InvokeError {
    pub fn bad_params(detail: impl Into<String>) -> Self {
        Self::BadParams(detail.into())
    }

    pub fn missing_param(name: &str) -> Self {
        Self::BadParams(format!("missing parameter: {name}"))
    }

    pub fn fault(message: impl fmt::Display) -> Self {
        Self::Fault(message.to_string())
    }
}

impl From<InvokeError> for Fault {
    fn from(err: InvokeError) -> Self {
        match err {
            InvokeError::BadParams(detail) => Fault::BadParams(detail),
            InvokeError::Fault(message) => Fault::Invocation(message),
        }
    }
}

/// Keyword-style parameters of one call.
#[derive(Debug, Clone, Default)]
pub struct Params(Map<String, Value>);

impl Params {
    pub fn new(params: Map<String, Value>) -> Self {
        Self(params)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Extract a required named parameter.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, InvokeError> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| InvokeError::missing_param(name))?;
        serde_json::from_value(value.clone())
            .map_err(|e| InvokeError::bad_params(format!("parameter {name}: {e}")))
    }

    /// Extract an optional named parameter.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, InvokeError> {
        match self.0.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| InvokeError::bad_params(format!("parameter {name}: {e}"))),
        }
    }

    /// Bind the whole mapping to a deserializable struct. With
    /// `#[serde(deny_unknown_fields)]` on the target type this enforces an
    /// exact keyword match.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, InvokeError> {
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| InvokeError::bad_params(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for Params {
    fn from(map: Map<String, Value>) -> Self {
        Self::new(map)
    }
}

/// Wire-encoding strategy for a target's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Value,
    Raw,
    Image,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Value => "value",
            PayloadKind::Raw => "raw",
            PayloadKind::Image => "image",
        }
    }
}

/// A target's return payload, already shaped for its declared kind.
#[derive(Debug, Clone)]
pub enum Payload {
    Value(Value),
    Raw(Vec<Bytes>),
    Image(ImageFrame),
}

impl From<Payload> for Reply {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Value(value) => Reply::Value(value),
            Payload::Raw(payloads) => Reply::Raw(payloads),
            Payload::Image(frame) => Reply::Image(frame),
        }
    }
}

pub type ValueFn = dyn Fn(&Params) -> Result<Value, InvokeError> + Send + Sync;
pub type RawFn = dyn Fn(&Params) -> Result<Vec<Bytes>, InvokeError> + Send + Sync;
pub type ImageFn = dyn Fn(&Params) -> Result<ImageFrame, InvokeError> + Send + Sync;

/// An invocable target. The variant fixes the payload kind at construction,
/// so a target cannot answer with a different wire shape per call.
#[derive(Clone)]
pub enum Callable {
    Value(Arc<ValueFn>),
    Raw(Arc<RawFn>),
    Image(Arc<ImageFn>),
}

impl Callable {
    pub fn value<F>(f: F) -> Self
    where
        F: Fn(&Params) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        Callable::Value(Arc::new(f))
    }

    pub fn raw<F>(f: F) -> Self
    where
        F: Fn(&Params) -> Result<Vec<Bytes>, InvokeError> + Send + Sync + 'static,
    {
        Callable::Raw(Arc::new(f))
    }

    pub fn image<F>(f: F) -> Self
    where
        F: Fn(&Params) -> Result<ImageFrame, InvokeError> + Send + Sync + 'static,
    {
        Callable::Image(Arc::new(f))
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Callable::Value(_) => PayloadKind::Value,
            Callable::Raw(_) => PayloadKind::Raw,
            Callable::Image(_) => PayloadKind::Image,
        }
    }

    pub fn invoke(&self, params: &Params) -> Result<Payload, InvokeError> {
        match self {
            Callable::Value(f) => f(params).map(Payload::Value),
            Callable::Raw(f) => f(params).map(Payload::Raw),
            Callable::Image(f) => f(params).map(Payload::Image),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callable").field(&self.kind().as_str()).finish()
    }
}

#[derive(Debug, Clone)]
struct MethodEntry {
    callable: Callable,
    enabled: bool,
}

/// Builder listing exactly the methods of one object to expose.
///
/// On `rebuild()` each enabled method lands in the dispatch table as
/// `"<object-name>.<method-name>"`. Methods start enabled; toggle with
/// [`CallRegistry::set_enabled`].
#[derive(Debug)]
pub struct ObjectExport {
    name: String,
    methods: BTreeMap<String, MethodEntry>,
}

impl ObjectExport {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(mut self, name: impl Into<String>, callable: Callable) -> Self {
        self.methods.insert(
            name.into(),
            MethodEntry {
                callable,
                enabled: true,
            },
        );
        self
    }

    pub fn value_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Params) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        self.method(name, Callable::value(f))
    }

    pub fn raw_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Params) -> Result<Vec<Bytes>, InvokeError> + Send + Sync + 'static,
    {
        self.method(name, Callable::raw(f))
    }

    pub fn image_method<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Params) -> Result<ImageFrame, InvokeError> + Send + Sync + 'static,
    {
        self.method(name, Callable::image(f))
    }
}

/// The flat name → callable table the serve loop dispatches against.
///
/// Immutable once published; the registry swaps in a whole new table on
/// `rebuild()`.
#[derive(Debug, Default)]
pub struct DispatchTable {
    entries: BTreeMap<String, Callable>,
}

impl DispatchTable {
    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up and invoke, helpers first. Invocation faults (including
    /// handler panics) come back as [`Fault`]s, never unwinds.
    pub fn dispatch(&self, call: &str, params: &Params) -> Result<Payload, Fault> {
        if call == LIST_CALLS {
            let names = self.names().into_iter().map(Value::String).collect();
            return Ok(Payload::Value(Value::Array(names)));
        }

        let callable = self
            .get(call)
            .ok_or_else(|| Fault::UnknownCall(call.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| callable.invoke(params))) {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(err)) => Err(err.into()),
            Err(panic) => Err(Fault::Invocation(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "target panicked".to_string()
    }
}

#[derive(Debug, Default)]
struct Inner {
    callables: BTreeMap<String, Callable>,
    objects: BTreeMap<String, BTreeMap<String, MethodEntry>>,
}

/// Registry of exported targets, with an atomically published dispatch table.
#[derive(Debug)]
pub struct CallRegistry {
    inner: Mutex<Inner>,
    table: RwLock<Arc<DispatchTable>>,
}

impl Default for CallRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            table: RwLock::new(Arc::new(DispatchTable::default())),
        }
    }

    /// Export a callable under a name. Re-registering a name replaces the
    /// prior entry.
    pub fn register(&self, name: impl Into<String>, callable: Callable) {
        let name = name.into();
        let kind = callable.kind();
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let replaced = inner.callables.insert(name.clone(), callable).is_some();
        tracing::debug!(call = %name, kind = kind.as_str(), replaced, "Exported callable");
    }

    pub fn register_value<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Params) -> Result<Value, InvokeError> + Send + Sync + 'static,
    {
        self.register(name, Callable::value(f));
    }

    pub fn register_raw<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Params) -> Result<Vec<Bytes>, InvokeError> + Send + Sync + 'static,
    {
        self.register(name, Callable::raw(f));
    }

    pub fn register_image<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Params) -> Result<ImageFrame, InvokeError> + Send + Sync + 'static,
    {
        self.register(name, Callable::image(f));
    }

    /// Export an object's listed methods.
    pub fn register_object(&self, object: ObjectExport) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let replaced = inner
            .objects
            .insert(object.name.clone(), object.methods)
            .is_some();
        tracing::debug!(object = %object.name, replaced, "Exported object");
    }

    /// Remove a callable, or an object and all its derived
    /// `"object.method"` entries. Unknown names are a warning, not an error.
    pub fn unregister(&self, name: &str) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        if inner.objects.remove(name).is_some() {
            tracing::debug!(object = %name, "Removed exported object");
            return;
        }
        if inner.callables.remove(name).is_some() {
            tracing::debug!(call = %name, "Removed exported callable");
            return;
        }
        tracing::warn!(name = %name, "Nothing exported under this name");
    }

    /// Toggle one exported method. Takes effect on the next `rebuild()`.
    pub fn set_enabled(&self, object: &str, method: &str, enabled: bool) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        match inner
            .objects
            .get_mut(object)
            .and_then(|methods| methods.get_mut(method))
        {
            Some(entry) => {
                entry.enabled = enabled;
                tracing::debug!(object = %object, method = %method, enabled, "Toggled exported method");
            }
            None => {
                tracing::warn!(object = %object, method = %method, "No such exported method");
            }
        }
    }

    /// Drop every registration. The published table is untouched until the
    /// next `rebuild()`.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.callables.clear();
        inner.objects.clear();
        tracing::debug!("Cleared registry");
    }

    /// Recompute the dispatch table from current registrations and publish
    /// it in one swap. Never invokes any target; safe to call repeatedly.
    pub fn rebuild(&self) {
        let inner = self.inner.lock().expect("registry lock poisoned");

        let mut entries = BTreeMap::new();
        for (name, callable) in &inner.callables {
            entries.insert(name.clone(), callable.clone());
        }
        for (object_name, methods) in &inner.objects {
            for (method_name, entry) in methods {
                if entry.enabled {
                    entries.insert(
                        format!("{object_name}.{method_name}"),
                        entry.callable.clone(),
                    );
                }
            }
        }

        let table = Arc::new(DispatchTable { entries });
        tracing::info!(calls = %table.names().join(", "), "Rebuilt dispatch table");
        *self.table.write().expect("registry lock poisoned") = table;
    }

    /// The currently published dispatch table.
    pub fn table(&self) -> Arc<DispatchTable> {
        self.table.read().expect("registry lock poisoned").clone()
    }
}
