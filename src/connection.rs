//! Shared bus connection.
//!
//! A [`Connection`] owns one transport and everything built on it:
//!
//! ```text
//! Connection ──owns──> dyn Transport
//!     │
//!     ├──owns──> listeners: service → path → PropertyChanges
//!     │                                        └─ one PropertiesChanged match
//!     └──owns──> observers (connected / disconnected)
//!
//! PendingCall ──keeps alive──> Connection   (until resolved)
//! ```
//!
//! Clones share state. Every operation is usable from any thread; callbacks
//! are never invoked with an internal lock held.

use crate::codec::{
    demarshall, demarshall_as, marshall_typed, marshall_value, CodecError, Demarshall, IntoArguments,
    TypedArg, Value, WireValue,
};
use crate::context::{Context, WeakContext};
use crate::pending::PendingCall;
use crate::properties::PropertyChanges;
use crate::transport::{MethodCall, Reply, SignalHandler, SignalMessage, SignalRule, Transport};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// The standard properties interface every object exposes.
pub const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";

/// Liveness transitions reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

struct Observer {
    context: WeakContext,
    event: ConnectionEvent,
    handler: Arc<dyn Fn() + Send + Sync>,
}

type ListenerMap = HashMap<String, HashMap<String, Arc<PropertyChanges>>>;

pub(crate) struct ConnectionInner {
    transport: RwLock<Arc<dyn Transport>>,
    /// Bumped on every reconnect; disconnect notifications carry the value
    /// they were armed with.
    generation: AtomicU64,
    listeners: Mutex<ListenerMap>,
    observers: Mutex<Vec<Observer>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let listeners = std::mem::take(self.listeners.get_mut());
        for listener in listeners.into_values().flat_map(HashMap::into_values) {
            listener.teardown();
        }
    }
}

/// A shared connection to one bus.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap a transport. The transport may already be disconnected; the
    /// connection then stays down until [`Connection::reconnect`].
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        if transport.is_connected() {
            debug!("Connected to {}", transport.name());
        } else {
            warn!(
                "Connection to {} failed. {}",
                transport.name(),
                transport
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Unknown error".to_string())
            );
        }

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                transport: RwLock::new(transport.clone()),
                generation: AtomicU64::new(0),
                listeners: Mutex::new(HashMap::new()),
                observers: Mutex::new(Vec::new()),
            }),
        };
        connection.arm_disconnect_watch(&transport, 0);
        connection
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ConnectionInner> {
        Arc::downgrade(&self.inner)
    }

    /// Whether two handles share the same underlying connection.
    pub fn same_connection(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The current transport.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport().is_connected()
    }

    fn arm_disconnect_watch(&self, transport: &Arc<dyn Transport>, generation: u64) {
        let weak = self.downgrade();
        transport.on_disconnected(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                Connection::from_inner(inner).handle_disconnect(generation);
            }
        }));
    }

    fn handle_disconnect(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            debug!("Ignoring disconnect from a replaced transport");
            return;
        }

        debug!("Disconnected from {}", self.transport().name());
        self.teardown_listeners();
        self.emit(ConnectionEvent::Disconnected);
    }

    fn teardown_listeners(&self) {
        let listeners = std::mem::take(&mut *self.inner.listeners.lock());
        for listener in listeners.into_values().flat_map(HashMap::into_values) {
            listener.teardown();
        }
    }

    /// Replace the transport with a freshly established one.
    ///
    /// Fails, leaving everything as it was, if the new transport is not
    /// connected. On success property listeners bound to the old transport
    /// are released, the disconnect watch is re-armed and a
    /// [`ConnectionEvent::Connected`] event fires.
    pub fn reconnect(&self, transport: Arc<dyn Transport>) -> bool {
        if !transport.is_connected() {
            warn!(
                "Reconnect to {} failed. {}",
                transport.name(),
                transport
                    .last_error()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "Not connected".to_string())
            );
            return false;
        }

        let generation = {
            let mut current = self.inner.transport.write();
            *current = transport.clone();
            self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        self.teardown_listeners();
        self.arm_disconnect_watch(&transport, generation);

        debug!("Connected to {}", transport.name());
        self.emit(ConnectionEvent::Connected);
        true
    }

    /// Run `handler` on every reconnect, for as long as `context` lives.
    pub fn on_connected(&self, context: &Context, handler: impl Fn() + Send + Sync + 'static) {
        self.observe(context, ConnectionEvent::Connected, handler);
    }

    /// Run `handler` when the connection drops, for as long as `context` lives.
    pub fn on_disconnected(&self, context: &Context, handler: impl Fn() + Send + Sync + 'static) {
        self.observe(context, ConnectionEvent::Disconnected, handler);
    }

    fn observe(&self, context: &Context, event: ConnectionEvent, handler: impl Fn() + Send + Sync + 'static) {
        self.inner.observers.lock().push(Observer {
            context: context.downgrade(),
            event,
            handler: Arc::new(handler),
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        let handlers: Vec<_> = {
            let mut observers = self.inner.observers.lock();
            observers.retain(|o| o.context.is_alive());
            observers
                .iter()
                .filter(|o| o.event == event)
                .map(|o| (o.context.clone(), o.handler.clone()))
                .collect()
        };
        for (context, handler) in handlers {
            if let Some(_context) = context.upgrade() {
                handler();
            }
        }
    }

    /// Start an asynchronous method call.
    ///
    /// Returns immediately. Register continuations on the returned
    /// [`PendingCall`]; they only run while `context` is alive.
    pub fn call(
        &self,
        context: &Context,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        arguments: impl IntoArguments,
    ) -> PendingCall {
        let call = MethodCall::new(service, path, interface, method).with_arguments(arguments);
        self.dispatch(context.downgrade(), call)
    }

    /// Start a call whose arguments carry explicit D-Bus types.
    ///
    /// Fails without dispatching anything if an argument cannot be
    /// represented as its declared type.
    pub fn typed_call(
        &self,
        context: &Context,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        arguments: &[TypedArg],
    ) -> Result<PendingCall, CodecError> {
        let arguments = arguments
            .iter()
            .map(marshall_typed)
            .collect::<Result<Vec<_>, _>>()
            .inspect_err(|e| warn!("Cannot call ({} {} {}.{}): {}", service, path, interface, method, e))?;
        Ok(self.call(context, service, path, interface, method, arguments))
    }

    /// Start a call with dynamically typed arguments.
    ///
    /// Each value is sent in its natural wire type; lists become typed arrays
    /// when homogeneous and maps become `a{sv}`.
    pub fn call_with_values(
        &self,
        context: &Context,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        arguments: &[Value],
    ) -> Result<PendingCall, CodecError> {
        let arguments = arguments
            .iter()
            .map(marshall_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.call(context, service, path, interface, method, arguments))
    }

    pub(crate) fn dispatch(&self, context: WeakContext, call: MethodCall) -> PendingCall {
        debug!("DBus invocation ({})", call);
        let pending = PendingCall::new(call.to_string(), context, Some(self.clone()));
        self.transport().call_with_callback(call, pending.callback());
        pending
    }

    /// Call a method and wait for the raw reply.
    pub async fn blocking_call(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        arguments: impl IntoArguments,
    ) -> Reply {
        let call = MethodCall::new(service, path, interface, method).with_arguments(arguments);
        debug!("DBus invocation ({})", call);
        self.transport().call(call).await
    }

    /// Send a method call without waiting for (or wanting) a reply.
    ///
    /// Returns whether the transport accepted the message.
    pub fn send(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        method: &str,
        arguments: impl IntoArguments,
    ) -> bool {
        let call = MethodCall::new(service, path, interface, method).with_arguments(arguments);
        debug!("DBus send ({})", call);
        self.transport().send(call)
    }

    /// Fetch a property with `Properties.Get`, variant layer removed.
    ///
    /// `None` (and a log line) if the call fails.
    pub async fn get_property(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
    ) -> Option<WireValue> {
        let reply = self
            .blocking_call(service, path, PROPERTIES_INTERFACE, "Get", (interface, property))
            .await;
        match reply {
            Ok(arguments) => {
                let value = arguments.into_iter().next().map(WireValue::into_inner_variant);
                if value.is_none() {
                    warn!("Empty reply getting property ({} {} {}.{})", service, path, interface, property);
                }
                value
            }
            Err(e) => {
                warn!("Failed to get property ({} {} {}.{}): {}", service, path, interface, property, e);
                None
            }
        }
    }

    /// The property listener for `(service, path)`, created on first use, with
    /// `context` registered as one of its subscribers.
    pub fn subscribe_to_object(&self, context: &Context, service: &str, path: &str) -> Arc<PropertyChanges> {
        let (listener, created) = {
            let mut listeners = self.inner.listeners.lock();
            let by_path = listeners.entry(service.to_string()).or_default();
            match by_path.get(path) {
                Some(listener) => (listener.clone(), false),
                None => {
                    let listener = PropertyChanges::new(self, service, path);
                    by_path.insert(path.to_string(), listener.clone());
                    (listener, true)
                }
            }
        };

        if created {
            listener.register(&self.transport());
        }
        listener.add_subscriber(context);
        listener
    }

    /// Follow one property.
    ///
    /// Returns once the subscription is in place. `on_changed` receives the
    /// current value when the seed fetch replies (or straight away if another
    /// subscriber already has it), then every change. Delivery stops when
    /// `context` is destroyed.
    pub fn subscribe_to_property<T, F>(
        &self,
        context: &Context,
        service: &str,
        path: &str,
        interface: &str,
        property: &str,
        on_changed: F,
    ) where
        T: Demarshall + Default + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let listener = self.subscribe_to_object(context, service, path);
        listener.add_filter(
            self,
            context,
            interface,
            property,
            Box::new(move |value: &WireValue| on_changed(demarshall_as::<T>(Some(value)))),
        );
    }

    /// Deliver a signal's normalized arguments to `handler` for as long as
    /// `context` lives. Returns whether the registration succeeded.
    pub fn connect_to_signal(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        signal: &str,
        context: &Context,
        handler: impl Fn(&[Value]) + Send + Sync + 'static,
    ) -> bool {
        let rule = SignalRule::new(service, path, interface, signal);
        let weak_context = context.downgrade();
        let handler: SignalHandler = Arc::new(move |message: &SignalMessage| {
            if let Some(_context) = weak_context.upgrade() {
                let arguments: Vec<Value> = message.arguments.iter().map(demarshall).collect();
                handler(&arguments);
            }
        });

        let transport = self.transport();
        match transport.connect_signal(rule.clone(), handler) {
            Ok(token) => {
                let weak_transport = Arc::downgrade(&transport);
                context.on_destroyed(move |_| {
                    if let Some(transport) = weak_transport.upgrade() {
                        transport.disconnect_signal(token);
                    }
                });
                true
            }
            Err(e) => {
                warn!("Failed to connect to ({}): {}", rule, e);
                false
            }
        }
    }

    /// The live listener for `(service, path)`, if any.
    pub fn property_listener(&self, service: &str, path: &str) -> Option<Arc<PropertyChanges>> {
        self.inner
            .listeners
            .lock()
            .get(service)
            .and_then(|by_path| by_path.get(path))
            .cloned()
    }

    /// Number of live property listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().values().map(HashMap::len).sum()
    }

    /// Unregister `listener` if it is the registered one for its key.
    ///
    /// The removed entry is returned so the caller drops it outside the lock.
    pub(crate) fn remove_listener(&self, listener: &Arc<PropertyChanges>) -> Option<Arc<PropertyChanges>> {
        let mut listeners = self.inner.listeners.lock();
        let by_path = listeners.get_mut(listener.service())?;
        let removed = match by_path.get(listener.path()) {
            Some(current) if Arc::ptr_eq(current, listener) => by_path.remove(listener.path()),
            _ => None,
        };
        if by_path.is_empty() {
            listeners.remove(listener.service());
        }
        removed
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport().name())
            .field("connected", &self.is_connected())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
