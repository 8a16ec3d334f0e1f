//! Service registration and method dispatch.
//!
//! A service is a receiver object plus the set of its callable methods.
//! Rust has no runtime reflection, so the dispatch table is built from
//! typed closures captured at registration: each method is stored
//! type-erased behind [`MethodHandler`], and the closure decodes its
//! argument and encodes its reply with whatever codec the connection
//! negotiated. The signature the builder accepts - one deserializable
//! argument, one serializable reply, an error-or-value return - is the
//! eligibility rule; anything else does not compile.
//!
//! # Example
//!
//! ```ignore
//! struct Foo;
//!
//! let service = Service::builder(Foo)
//!     .method("Sum", |_foo, args: Args| async move { Ok(args.num1 + args.num2) })
//!     .build()?;
//! server.register(service)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Boxed future returned by type-erased method handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error a method implementation hands back to its caller.
///
/// It crosses the wire as the response header's error string, so it is
/// just a message.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct MethodError(String);

impl MethodError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Result type for method implementations.
pub type MethodResult<R> = std::result::Result<R, MethodError>;

/// Type-erased method invoker.
///
/// `invoke` decodes the argument bytes, runs the method, and encodes
/// the reply, all with the connection's codec; the server never sees
/// the concrete types.
trait MethodHandler: Send + Sync {
    fn invoke(&self, codec: CodecType, args: &[u8]) -> BoxFuture<'static, Result<Vec<u8>>>;
}

/// Bridges a typed async closure into [`MethodHandler`].
struct TypedMethod<T, A, R, F, Fut> {
    receiver: Arc<T>,
    method: F,
    _marker: PhantomData<fn(A) -> (R, Fut)>,
}

impl<T, A, R, F, Fut> MethodHandler for TypedMethod<T, A, R, F, Fut>
where
    T: Send + Sync + 'static,
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MethodResult<R>> + Send + 'static,
{
    fn invoke(&self, codec: CodecType, args: &[u8]) -> BoxFuture<'static, Result<Vec<u8>>> {
        let argv: A = match codec.decode(args) {
            Ok(argv) => argv,
            Err(err) => return Box::pin(async move { Err(err) }),
        };

        let fut = (self.method)(Arc::clone(&self.receiver), argv);
        Box::pin(async move {
            let replyv = fut.await.map_err(|err| RpcError::Remote(err.to_string()))?;
            codec.encode(&replyv)
        })
    }
}

/// One registered method: its invoker plus bookkeeping.
pub struct MethodDescriptor {
    handler: Box<dyn MethodHandler>,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
}

impl MethodDescriptor {
    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Argument type name, for the debug view.
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Reply type name, for the debug view.
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    pub(crate) fn invoke(
        &self,
        codec: CodecType,
        args: &[u8],
    ) -> BoxFuture<'static, Result<Vec<u8>>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        self.handler.invoke(codec, args)
    }
}

/// A named receiver with its callable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, MethodDescriptor>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// Start building a service around `receiver`.
    ///
    /// The service name is derived from the receiver's type name; use
    /// [`ServiceBuilder::named`] to override it.
    pub fn builder<T: Send + Sync + 'static>(receiver: T) -> ServiceBuilder<T> {
        ServiceBuilder {
            name: short_type_name::<T>().to_string(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// The service name clients address this service by.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Iterate the registered methods, for the debug view.
    pub fn methods(&self) -> impl Iterator<Item = (&str, &MethodDescriptor)> {
        self.methods.iter().map(|(name, desc)| (name.as_str(), desc))
    }

    /// Resolve a method and produce its invocation future.
    pub(crate) fn invoke(
        &self,
        method: &str,
        codec: CodecType,
        args: &[u8],
    ) -> Result<BoxFuture<'static, Result<Vec<u8>>>> {
        let desc = self
            .methods
            .get(method)
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
        Ok(desc.invoke(codec, args))
    }
}

/// Builder collecting the methods of one service.
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, MethodDescriptor>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Override the derived service name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Register a method.
    ///
    /// The handler receives the shared receiver and the decoded
    /// argument, and returns the reply or a [`MethodError`].
    pub fn method<A, R, F, Fut>(mut self, name: &str, method: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<T>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult<R>> + Send + 'static,
    {
        let handler = TypedMethod {
            receiver: Arc::clone(&self.receiver),
            method,
            _marker: PhantomData,
        };
        self.methods.insert(
            name.to_string(),
            MethodDescriptor {
                handler: Box::new(handler),
                arg_type: short_type_name::<A>(),
                reply_type: short_type_name::<R>(),
                num_calls: AtomicU64::new(0),
            },
        );
        self
    }

    /// Finish the service, validating its name.
    pub fn build(self) -> Result<Service> {
        if !is_exported_name(&self.name) {
            return Err(RpcError::InvalidServiceName(self.name));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Split `"Service.Method"` on the last dot.
pub(crate) fn split_service_method(service_method: &str) -> Result<(&str, &str)> {
    service_method
        .rsplit_once('.')
        .ok_or_else(|| RpcError::IllFormedServiceMethod(service_method.to_string()))
}

/// Last path segment of a type name, generics stripped:
/// `demo::arith::Foo<Bar>` becomes `Foo`.
fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Exported identifier: leading ASCII uppercase, alphanumeric rest.
fn is_exported_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}
