use crate::conf::{CallType, ReferenceConfig};
use crate::context::CallContext;
use crate::metrics::{CallMonitor, MessageRecorder, MetricsFactory};
use crate::rpc::{Metadata, MethodDescriptor, Status, code_of};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Writes the caller's current context into outgoing metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextClientInterceptor;

impl ContextClientInterceptor {
    pub fn inject(&self, metadata: &mut Metadata) {
        CallContext::current().encode_into(metadata);
    }
}

/// Reads the context of an incoming call and binds it to the handler.
///
/// Decoding is best-effort: a corrupt entry is logged and the handler runs
/// with an empty context.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextServerInterceptor;

impl ContextServerInterceptor {
    pub fn extract(&self, metadata: &Metadata) -> CallContext {
        match CallContext::decode_from(metadata) {
            Ok(context) => context,
            Err(e) => {
                log::warn!("drop call context of incoming call: {}", e);
                CallContext::default()
            }
        }
    }

    pub async fn intercept<F, Fut>(&self, metadata: &Metadata, handler: F) -> Fut::Output
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        self.extract(metadata)
            .scope(async move { handler().await })
            .await
    }
}

/// Server side chain: context extraction, then call metrics around the handler.
#[derive(Debug, Clone)]
pub struct ServerInterceptor {
    context: ContextServerInterceptor,
    metrics: Arc<MetricsFactory>,
}

impl ServerInterceptor {
    pub fn new(metrics: Arc<MetricsFactory>) -> Self {
        ServerInterceptor {
            context: ContextServerInterceptor,
            metrics,
        }
    }

    /// Run `handler` for one incoming call of `method`.
    ///
    /// The handler gets a [`MessageRecorder`] to count stream messages. If the
    /// returned future is dropped before completion the call counts as
    /// cancelled.
    pub async fn intercept<T, F, Fut>(
        &self,
        method: &MethodDescriptor,
        metadata: &Metadata,
        handler: F,
    ) -> Result<T, Status>
    where
        F: FnOnce(MessageRecorder) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let monitor = CallMonitor::start(self.metrics.for_method(method));
        let recorder = monitor.recorder();
        let result = self
            .context
            .intercept(metadata, move || handler(recorder))
            .await;
        monitor.finish(code_of(&result));
        result
    }
}

/// Result of a call issued through [`ClientInterceptor::invoke`].
pub enum CallHandle<T> {
    /// The call already completed on the caller's task.
    Ready(Result<T, Status>),
    /// The call runs on its own task.
    Pending(JoinHandle<Result<T, Status>>),
}

impl<T> CallHandle<T> {
    pub async fn wait(self) -> Result<T, Status> {
        match self {
            CallHandle::Ready(result) => result,
            CallHandle::Pending(handle) => match handle.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(Status::cancelled("call task aborted")),
                Err(e) => Err(Status::internal(format!("call task failed: {}", e))),
            },
        }
    }
}

/// Client side chain of one remote reference: context injection and call
/// metrics, with completion following the reference's call type.
///
/// Calls that complete on another task carry a snapshot of the caller's
/// context, taken when the call is issued.
#[derive(Debug, Clone)]
pub struct ClientInterceptor {
    reference: ReferenceConfig,
    context: ContextClientInterceptor,
    metrics: Arc<MetricsFactory>,
}

impl ClientInterceptor {
    pub fn new(reference: ReferenceConfig, metrics: Arc<MetricsFactory>) -> Self {
        ClientInterceptor {
            reference,
            context: ContextClientInterceptor,
            metrics,
        }
    }

    pub fn reference(&self) -> &ReferenceConfig {
        &self.reference
    }

    fn prepare(&self, method: &MethodDescriptor) -> (Metadata, CallMonitor) {
        let mut metadata = Metadata::new();
        self.context.inject(&mut metadata);
        let monitor = CallMonitor::start(self.metrics.for_method(method));
        (metadata, monitor)
    }

    /// Issue a call and await it on the calling task.
    pub async fn call<T, F, Fut>(&self, method: &MethodDescriptor, invoke: F) -> Result<T, Status>
    where
        F: FnOnce(Metadata, MessageRecorder) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let (metadata, monitor) = self.prepare(method);
        let result = invoke(metadata, monitor.recorder()).await;
        monitor.finish(code_of(&result));
        result
    }

    /// Issue a call on its own task and return a handle to its result.
    pub fn call_future<T, F, Fut>(
        &self,
        method: &MethodDescriptor,
        invoke: F,
    ) -> JoinHandle<Result<T, Status>>
    where
        T: Send + 'static,
        F: FnOnce(Metadata, MessageRecorder) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Status>> + Send + 'static,
    {
        let (metadata, monitor) = self.prepare(method);
        let captured = CallContext::capture();
        tokio::spawn(captured.scope(async move {
            let result = invoke(metadata, monitor.recorder()).await;
            monitor.finish(code_of(&result));
            result
        }))
    }

    /// Issue a call on its own task; `callback` receives the result there,
    /// with the caller's context bound.
    pub fn call_async<T, F, Fut, C>(&self, method: &MethodDescriptor, invoke: F, callback: C)
    where
        T: Send + 'static,
        F: FnOnce(Metadata, MessageRecorder) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Status>> + Send + 'static,
        C: FnOnce(Result<T, Status>) + Send + 'static,
    {
        let (metadata, monitor) = self.prepare(method);
        let captured = CallContext::capture();
        tokio::spawn(captured.scope(async move {
            let result = invoke(metadata, monitor.recorder()).await;
            monitor.finish(code_of(&result));
            callback(result);
        }));
    }

    /// Issue a call the way the reference's call type asks for.
    ///
    /// `async` references have no callback here and behave like `future`.
    pub async fn invoke<T, F, Fut>(&self, method: &MethodDescriptor, invoke: F) -> CallHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Metadata, MessageRecorder) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Status>> + Send + 'static,
    {
        match self.reference.call_type {
            CallType::Blocking => CallHandle::Ready(self.call(method, invoke).await),
            CallType::Future | CallType::Async => {
                CallHandle::Pending(self.call_future(method, invoke))
            }
        }
    }
}
