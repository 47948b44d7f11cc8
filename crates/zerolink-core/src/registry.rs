//! Remotely callable methods of a service.
//!
//! A [`MethodRegistry`] is built at startup and handed to a
//! [`Container`](crate::Container). Only methods registered here can be called;
//! anything else is silently ignored by the container.

use crate::marshal::{Fault, ServiceError};
use crate::protocol::{Headers, Kwargs, RpcRequest};
use crate::service::Service;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// `ClassName.methodName`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodKey {
    pub class: String,
    pub method: String,
}

impl MethodKey {
    pub fn new(class: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            method: method.into(),
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.method)
    }
}

/// Accepted shape of one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Never checked.
    Any,
    Int,
    /// Any number, integers included.
    Float,
    Str,
    Bool,
    List,
    Map,
}

impl ParamKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamKind::Any => true,
            ParamKind::Int => value.is_i64() || value.is_u64(),
            ParamKind::Float => value.is_number(),
            ParamKind::Str => value.is_string(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::List => value.is_array(),
            ParamKind::Map => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamKind::Any => "any",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Str => "str",
            ParamKind::Bool => "bool",
            ParamKind::List => "list",
            ParamKind::Map => "dict",
        }
    }
}

/// Declared parameter of a registered method, in positional order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
}

impl ParamSpec {
    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// A required parameter.
pub fn param(name: impl Into<String>, kind: ParamKind) -> ParamSpec {
    ParamSpec {
        name: name.into(),
        kind,
        required: true,
    }
}

/// Arguments of one incoming call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    pub headers: Headers,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: Kwargs) -> Self {
        Self {
            args,
            kwargs,
            headers: Headers::new(),
        }
    }

    /// Raw argument at `index`, or the keyword argument `name`.
    pub fn raw(&self, index: usize, name: &str) -> Option<&Value> {
        self.args.get(index).or_else(|| self.kwargs.get(name))
    }

    /// Typed argument at `index`, or the keyword argument `name`.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, Fault> {
        let value = self.raw(index, name).ok_or_else(|| {
            ServiceError::type_error(format!("missing required argument '{}'", name))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ServiceError::value(format!("Argument {} has an invalid value: {}", name, e)).into()
        })
    }

    /// Like [`get`](Self::get) but absent or null arguments are `None`.
    pub fn get_opt<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, Fault> {
        match self.raw(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.get(index, name).map(Some),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

impl From<RpcRequest> for CallArgs {
    fn from(request: RpcRequest) -> Self {
        Self {
            args: request.args,
            kwargs: request.kwargs,
            headers: request.meta.headers,
        }
    }
}

pub type MethodFuture = BoxFuture<'static, Result<Value, Fault>>;

/// Invokes one method on the shared service instance.
pub type MethodHandler<S> = Arc<dyn Fn(Arc<S>, CallArgs) -> MethodFuture + Send + Sync>;

/// Registered method: optional declared parameters plus the handler.
pub struct MethodEntry<S> {
    pub params: Option<Vec<ParamSpec>>,
    pub handler: MethodHandler<S>,
}

impl<S> Clone for MethodEntry<S> {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Methods of service `S` callable from remote processes.
pub struct MethodRegistry<S> {
    methods: HashMap<MethodKey, MethodEntry<S>>,
    _service: PhantomData<fn() -> S>,
}

impl<S: Service> MethodRegistry<S> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            _service: PhantomData,
        }
    }

    /// Register `method` with declared parameters. Registering the same name
    /// again replaces the previous entry.
    pub fn register<F, Fut>(&mut self, method: &str, params: Vec<ParamSpec>, handler: F) -> &mut Self
    where
        F: Fn(Arc<S>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        self.insert(method, Some(params), handler)
    }

    /// Register `method` without declared parameters; validation skips it.
    pub fn register_untyped<F, Fut>(&mut self, method: &str, handler: F) -> &mut Self
    where
        F: Fn(Arc<S>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        self.insert(method, None, handler)
    }

    fn insert<F, Fut>(&mut self, method: &str, params: Option<Vec<ParamSpec>>, handler: F) -> &mut Self
    where
        F: Fn(Arc<S>, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Fault>> + Send + 'static,
    {
        let handler: MethodHandler<S> = Arc::new(move |service, call| Box::pin(handler(service, call)));
        self.methods
            .insert(MethodKey::new(S::CLASS, method), MethodEntry { params, handler });
        self
    }

    pub fn lookup(&self, key: &MethodKey) -> Option<&MethodEntry<S>> {
        self.methods.get(key)
    }

    /// Entry for `method` of this registry's service class.
    pub fn get(&self, method: &str) -> Option<&MethodEntry<S>> {
        self.lookup(&MethodKey::new(S::CLASS, method))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.get(method).is_some()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<&MethodKey> {
        let mut keys: Vec<&MethodKey> = self.methods.keys().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl<S: Service> Default for MethodRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for MethodRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::testing::Counter;
    use serde_json::json;

    fn registry() -> MethodRegistry<Counter> {
        let mut registry = MethodRegistry::new();
        registry
            .register("add", vec![param("n", ParamKind::Int)], |svc: Arc<Counter>, call| async move {
                let n: i64 = call.get(0, "n")?;
                Ok(json!(svc.add(n)))
            })
            .register_untyped("get", |svc: Arc<Counter>, _| async move { Ok(json!(svc.value())) });
        registry
    }

    #[test]
    fn test_keys_use_class_name() {
        let registry = registry();
        let keys: Vec<String> = registry.keys().iter().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["Counter.add", "Counter.get"]);
        assert!(registry.lookup(&MethodKey::new("Other", "add")).is_none());
    }

    #[test]
    fn test_reregistration_replaces_entry() {
        let mut registry = registry();
        registry.register_untyped("add", |_: Arc<Counter>, _| async move { Ok(json!("replaced")) });

        assert_eq!(registry.len(), 2);
        assert!(registry.get("add").unwrap().params.is_none());
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let registry = registry();
        let service = Arc::new(Counter::default());
        let entry = registry.get("add").unwrap();

        let result = (entry.handler)(service.clone(), CallArgs::new(vec![json!(5)], Kwargs::new()))
            .await
            .unwrap();
        assert_eq!(result, json!(5));
        assert_eq!(service.value(), 5);
    }

    #[test]
    fn test_call_args_positional_then_keyword() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("b".into(), json!(2));
        let call = CallArgs::new(vec![json!(1)], kwargs);

        assert_eq!(call.get::<i64>(0, "a").unwrap(), 1);
        assert_eq!(call.get::<i64>(1, "b").unwrap(), 2);
        assert_eq!(call.get_opt::<i64>(2, "c").unwrap(), None);

        let missing = call.get::<i64>(2, "c").unwrap_err();
        assert_eq!(missing.exc_type(), "TypeError");
        let wrong = call.get::<String>(0, "a").unwrap_err();
        assert_eq!(wrong.exc_type(), "ValueError");
    }

    #[test]
    fn test_param_kinds() {
        assert!(ParamKind::Int.matches(&json!(3)));
        assert!(!ParamKind::Int.matches(&json!(3.5)));
        assert!(ParamKind::Float.matches(&json!(3)));
        assert!(ParamKind::Map.matches(&json!({"a": 1})));
        assert!(ParamKind::Any.matches(&Value::Null));
        assert!(!ParamKind::Str.matches(&json!(1)));
    }
}
