//! Inbound call handler contract.
//!
//! Service dispatch proper lives outside the core; this is the seam it plugs
//! into. Handlers are keyed by method name and run on their own task per
//! call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BoxFuture;
use crate::inbound::InboundCall;

/// Handles one inbound call. The handler owns the call's [`Response`]
/// (via [`InboundCall::response`]) and must either respond or blackhole it.
///
/// [`Response`]: crate::inbound::Response
pub trait CallHandler: Send + Sync + 'static {
    fn handle(&self, call: InboundCall) -> BoxFuture<'static, ()>;
}

/// Adapter for plain async closures.
pub struct HandlerFn<F>(pub F);

impl<F, Fut> CallHandler for HandlerFn<F>
where
    F: Fn(InboundCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn handle(&self, call: InboundCall) -> BoxFuture<'static, ()> {
        Box::pin((self.0)(call))
    }
}

/// Method-name keyed handler table.
pub(crate) struct HandlerRegistry {
    handlers: Mutex<HashMap<String, Arc<dyn CallHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn CallHandler>) {
        self.handlers.lock().insert(method.into(), handler);
    }

    pub fn get(&self, method: &str) -> Option<Arc<dyn CallHandler>> {
        self.handlers.lock().get(method).cloned()
    }
}
