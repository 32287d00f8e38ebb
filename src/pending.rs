//! In-flight method calls.
//!
//! A [`PendingCall`] is returned by every asynchronous call. It resolves
//! exactly once, with the reply arguments or with an error, and hands that
//! outcome to every continuation registered on it, before or after the fact.
//!
//! Continuations are bound to the caller's [`Context`](crate::Context): once
//! the context is gone nothing is delivered, but the remote call itself is
//! not aborted.

use crate::codec::{demarshall_as, Demarshall, WireValue};
use crate::connection::Connection;
use crate::context::WeakContext;
use crate::error::BusError;
use crate::transport::{Reply, ReplyCallback};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

type SuccessHandler = Box<dyn FnOnce(&[WireValue]) + Send>;
type ErrorHandler = Box<dyn FnOnce(&BusError) + Send>;

/// A success continuation taking 0, 1 or 2 typed reply arguments.
///
/// Arguments are extracted positionally with [`demarshall_as`]: extra reply
/// arguments are ignored, missing ones arrive as `Default::default()`.
///
/// ```ignore
/// call.on_finished(|| println!("done"));
/// call.on_finished(|count: u32| println!("{count}"));
/// call.on_finished(|name: String, value: Value| println!("{name}={value}"));
/// ```
pub trait ReplyHandler<Args>: Send + 'static {
    fn invoke(self, arguments: &[WireValue]);
}

impl<F> ReplyHandler<()> for F
where
    F: FnOnce() + Send + 'static,
{
    fn invoke(self, _arguments: &[WireValue]) {
        self()
    }
}

impl<F, A> ReplyHandler<(A,)> for F
where
    F: FnOnce(A) + Send + 'static,
    A: Demarshall + Default,
{
    fn invoke(self, arguments: &[WireValue]) {
        self(demarshall_as(arguments.first()))
    }
}

impl<F, A, B> ReplyHandler<(A, B)> for F
where
    F: FnOnce(A, B) + Send + 'static,
    A: Demarshall + Default,
    B: Demarshall + Default,
{
    fn invoke(self, arguments: &[WireValue]) {
        self(demarshall_as(arguments.first()), demarshall_as(arguments.get(1)))
    }
}

#[derive(Default)]
struct State {
    outcome: Option<Reply>,
    on_success: Vec<SuccessHandler>,
    on_error: Vec<ErrorHandler>,
    waiters: Vec<oneshot::Sender<Reply>>,
    /// Keeps the connection (and its transport) alive until resolution.
    connection: Option<Connection>,
}

struct Shared {
    target: String,
    context: WeakContext,
    state: Mutex<State>,
}

/// Handle to one outstanding call. Cheap to clone.
#[derive(Clone)]
pub struct PendingCall {
    shared: Arc<Shared>,
}

impl PendingCall {
    pub(crate) fn new(target: String, context: WeakContext, connection: Option<Connection>) -> Self {
        Self {
            shared: Arc::new(Shared {
                target,
                context,
                state: Mutex::new(State {
                    connection,
                    ..State::default()
                }),
            }),
        }
    }

    /// A call that failed before it could be dispatched.
    pub(crate) fn failed(target: String, context: WeakContext, error: BusError) -> Self {
        let call = Self::new(target, context, None);
        call.resolve(Err(error));
        call
    }

    /// The transport-facing continuation that resolves this call.
    pub(crate) fn callback(&self) -> ReplyCallback {
        let call = self.clone();
        Box::new(move |reply| call.resolve(reply))
    }

    /// Record the outcome and deliver it. Later outcomes are ignored.
    pub(crate) fn resolve(&self, reply: Reply) {
        let (on_success, on_error, waiters, connection) = {
            let mut state = self.shared.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(reply.clone());
            (
                std::mem::take(&mut state.on_success),
                std::mem::take(&mut state.on_error),
                std::mem::take(&mut state.waiters),
                state.connection.take(),
            )
        };

        if let Err(e) = &reply {
            warn!("DBus error ({}): {}", self.shared.target, e);
        }

        for waiter in waiters {
            let _ = waiter.send(reply.clone());
        }

        // Hold the context for the duration of the delivery
        if let Some(_context) = self.shared.context.upgrade() {
            match &reply {
                Ok(arguments) => on_success.into_iter().for_each(|handler| handler(arguments)),
                Err(error) => on_error.into_iter().for_each(|handler| handler(error)),
            }
        }

        drop(connection);
    }

    /// Register a success continuation. Runs immediately if the call already
    /// succeeded.
    pub fn on_finished<Args, H>(&self, handler: H) -> &Self
    where
        H: ReplyHandler<Args>,
    {
        self.on_arguments(move |arguments: &[WireValue]| handler.invoke(arguments))
    }

    /// Register a success continuation that receives the raw reply arguments.
    pub fn on_arguments<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(&[WireValue]) + Send + 'static,
    {
        let handler: SuccessHandler = Box::new(handler);
        let outcome = {
            let mut state = self.shared.state.lock();
            match state.outcome.clone() {
                None => {
                    state.on_success.push(handler);
                    return self;
                }
                Some(outcome) => outcome,
            }
        };

        if let (Ok(arguments), Some(_context)) = (outcome, self.shared.context.upgrade()) {
            handler(&arguments);
        }
        self
    }

    /// Register an error continuation. Runs immediately if the call already
    /// failed.
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: FnOnce(BusError) + Send + 'static,
    {
        let handler: ErrorHandler = Box::new(move |error| handler(error.clone()));
        let outcome = {
            let mut state = self.shared.state.lock();
            match state.outcome.clone() {
                None => {
                    state.on_error.push(handler);
                    return self;
                }
                Some(outcome) => outcome,
            }
        };

        if let (Err(error), Some(_context)) = (outcome, self.shared.context.upgrade()) {
            handler(&error);
        }
        self
    }

    /// Wait for the outcome, regardless of the context's lifetime.
    pub async fn finished(&self) -> Reply {
        let receiver = {
            let mut state = self.shared.state.lock();
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push(sender);
            receiver
        };
        receiver.await.unwrap_or_else(|_| Err(BusError::no_reply()))
    }

    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().outcome.is_some()
    }

    pub fn is_error(&self) -> bool {
        matches!(self.shared.state.lock().outcome, Some(Err(_)))
    }

    /// The outcome, once resolved.
    pub fn reply(&self) -> Option<Reply> {
        self.shared.state.lock().outcome.clone()
    }

    pub fn error(&self) -> Option<BusError> {
        match &self.shared.state.lock().outcome {
            Some(Err(error)) => Some(error.clone()),
            _ => None,
        }
    }

    /// `service path interface.method`.
    pub fn target(&self) -> &str {
        &self.shared.target
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("target", &self.shared.target)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::context::Context;

    fn pending(context: &Context) -> PendingCall {
        PendingCall::new("svc /path iface.Method".into(), context.downgrade(), None)
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(T) + Send + Sync + Clone + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |value: T| sink.lock().push(value))
    }

    #[test]
    fn test_resolves_exactly_once() {
        let context = Context::new();
        let call = pending(&context);
        let (values, record) = recorder::<i32>();
        let (errors, record_error) = recorder::<BusError>();

        call.on_finished(move |v: i32| record(v)).on_error(move |e| record_error(e));
        call.resolve(Ok(vec![WireValue::Int32(1)]));
        call.resolve(Ok(vec![WireValue::Int32(2)]));
        call.resolve(Err(BusError::failed("late")));

        assert_eq!(*values.lock(), vec![1]);
        assert!(errors.lock().is_empty());
        assert!(call.is_finished());
        assert!(!call.is_error());
    }

    #[test]
    fn test_late_registration_sees_outcome() {
        let context = Context::new();
        let call = pending(&context);
        call.resolve(Err(BusError::service_unknown("org.example.svc")));

        let (errors, record_error) = recorder::<BusError>();
        let (successes, record) = recorder::<()>();
        call.on_error(move |e| record_error(e));
        call.on_finished(move || record(()));

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].is(BusError::SERVICE_UNKNOWN));
        assert!(successes.lock().is_empty());
        assert!(call.error().is_some());
    }

    #[test]
    fn test_destroyed_context_cancels_delivery() {
        let context = Context::new();
        let call = pending(&context);
        let (values, record) = recorder::<()>();
        call.on_finished(move || record(()));

        drop(context);
        call.resolve(Ok(vec![]));

        assert!(values.lock().is_empty());
        assert!(call.is_finished());
    }

    #[test]
    fn test_arity_and_defaults() {
        let context = Context::new();
        let call = pending(&context);
        let (pairs, record_pair) = recorder::<(String, u32)>();
        let (singles, record_single) = recorder::<Value>();

        call.on_finished(move |name: String, count: u32| record_pair((name, count)));
        call.on_finished(move |first: Value| record_single(first));
        call.resolve(Ok(vec![
            WireValue::String("name".into()),
            WireValue::UInt32(3),
            WireValue::Bool(true),
        ]));
        assert_eq!(*pairs.lock(), vec![("name".to_string(), 3)]);
        assert_eq!(*singles.lock(), vec![Value::from("name")]);

        let short = pending(&context);
        let (pairs, record_pair) = recorder::<(String, u32)>();
        short.resolve(Ok(vec![WireValue::String("only".into())]));
        short.on_finished(move |name: String, count: u32| record_pair((name, count)));
        assert_eq!(*pairs.lock(), vec![("only".to_string(), 0)]);
    }

    #[test]
    fn test_failed_constructor() {
        let context = Context::new();
        let call = PendingCall::failed("t".into(), context.downgrade(), BusError::invalid_args("bad"));
        assert!(call.is_error());
        assert_eq!(call.target(), "t");
    }

    #[tokio::test]
    async fn test_finished_future() {
        let context = Context::new();
        let call = pending(&context);
        let resolver = call.clone();
        tokio::spawn(async move {
            resolver.resolve(Ok(vec![WireValue::Bool(true)]));
        });
        assert_eq!(call.finished().await, Ok(vec![WireValue::Bool(true)]));
        assert_eq!(call.finished().await, Ok(vec![WireValue::Bool(true)]));
    }
}
