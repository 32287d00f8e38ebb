//! Property change cache.
//!
//! One [`PropertyChanges`] listener exists per `(service, path)` on a
//! connection. It owns the single `PropertiesChanged` match for that object,
//! caches the last value of every property someone follows and fans updates
//! out to the per-subscriber filters.
//!
//! Listeners live as long as they have subscribers. When the last subscribing
//! context is destroyed the listener unregisters itself and drops its match;
//! the next subscription creates a fresh one.

use crate::codec::WireValue;
use crate::connection::{Connection, ConnectionInner, PROPERTIES_INTERFACE};
use crate::context::{Context, ContextId, WeakContext};
use crate::transport::{SignalHandler, SignalMessage, SignalRule, SignalToken, Transport};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type DeliverFn = Box<dyn Fn(&WireValue) + Send + Sync>;

type PropertyKey = (String, String);

/// One subscriber's interest in one property.
struct Filter {
    context: WeakContext,
    key: PropertyKey,
    /// Set once this filter has been given any value.
    seeded: AtomicBool,
    deliver: DeliverFn,
}

impl Filter {
    fn deliver(&self, value: &WireValue) {
        if let Some(_context) = self.context.upgrade() {
            self.seeded.store(true, Ordering::SeqCst);
            (self.deliver)(value);
        }
    }
}

enum Seed {
    Cached(WireValue),
    Fetch,
    InFlight,
}

#[derive(Default)]
struct State {
    subscribers: Vec<ContextId>,
    filters: Vec<Arc<Filter>>,
    values: HashMap<PropertyKey, WireValue>,
    seeding: HashSet<PropertyKey>,
    registration: Option<(SignalToken, Weak<dyn Transport>)>,
    torn_down: bool,
}

/// Change listener for one remote object.
pub struct PropertyChanges {
    id: u64,
    service: String,
    path: String,
    connection: Weak<ConnectionInner>,
    /// Lifetime of the re-fetches this listener issues.
    context: Context,
    state: Mutex<State>,
}

impl PropertyChanges {
    pub(crate) fn new(connection: &Connection, service: &str, path: &str) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            service: service.to_string(),
            path: path.to_string(),
            connection: connection.downgrade(),
            context: Context::new(),
            state: Mutex::new(State::default()),
        })
    }

    /// Identity of this listener instance. A listener recreated after teardown
    /// gets a new id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Whether the `PropertiesChanged` match is in place. A listener whose
    /// registration failed still serves seed values but sees no changes.
    pub fn is_registered(&self) -> bool {
        self.state.lock().registration.is_some()
    }

    /// Last known value of a followed property.
    pub fn cached_value(&self, interface: &str, property: &str) -> Option<WireValue> {
        self.state
            .lock()
            .values
            .get(&(interface.to_string(), property.to_string()))
            .cloned()
    }

    /// Install the `PropertiesChanged` match on `transport`.
    pub(crate) fn register(self: &Arc<Self>, transport: &Arc<dyn Transport>) {
        let weak = Arc::downgrade(self);
        let handler: SignalHandler = Arc::new(move |signal: &SignalMessage| {
            if let Some(listener) = weak.upgrade() {
                listener.handle_signal(signal);
            }
        });

        let rule = SignalRule::new(&self.service, &self.path, PROPERTIES_INTERFACE, "PropertiesChanged");
        match transport.connect_signal(rule, handler) {
            Ok(token) => {
                let stale = {
                    let mut state = self.state.lock();
                    if state.torn_down {
                        true
                    } else {
                        state.registration = Some((token, Arc::downgrade(transport)));
                        false
                    }
                };
                if stale {
                    transport.disconnect_signal(token);
                }
            }
            Err(e) => warn!(
                "Failed to subscribe to property changes ({} {}): {}",
                self.service, self.path, e
            ),
        }
    }

    /// Record `context` as a subscriber. Adding the same context twice has no
    /// effect.
    pub(crate) fn add_subscriber(self: &Arc<Self>, context: &Context) {
        let id = context.id();
        {
            let mut state = self.state.lock();
            if state.subscribers.contains(&id) {
                return;
            }
            state.subscribers.push(id);
        }

        let weak = Arc::downgrade(self);
        context.on_destroyed(move |id| {
            if let Some(listener) = weak.upgrade() {
                listener.subscriber_destroyed(id);
            }
        });
    }

    fn subscriber_destroyed(self: &Arc<Self>, id: ContextId) {
        let last = {
            let mut state = self.state.lock();
            state.subscribers.retain(|s| *s != id);
            state.filters.retain(|f| f.context.is_alive());
            state.subscribers.is_empty() && !state.torn_down
        };
        if !last {
            return;
        }

        debug!("Releasing property listener ({} {})", self.service, self.path);
        if let Some(inner) = self.connection.upgrade() {
            let removed = Connection::from_inner(inner).remove_listener(self);
            drop(removed);
        }
        self.teardown();
    }

    /// Follow one property on behalf of `context`.
    ///
    /// Returns at once. A cached value is delivered straight away, otherwise
    /// the seed `Get` is sent and its reply delivered when it arrives.
    pub(crate) fn add_filter(
        self: &Arc<Self>,
        connection: &Connection,
        context: &Context,
        interface: &str,
        property: &str,
        deliver: DeliverFn,
    ) {
        let key = (interface.to_string(), property.to_string());
        let filter = Arc::new(Filter {
            context: context.downgrade(),
            key: key.clone(),
            seeded: AtomicBool::new(false),
            deliver,
        });

        let seed = {
            let mut state = self.state.lock();
            state.filters.push(filter.clone());
            if let Some(value) = state.values.get(&key) {
                Seed::Cached(value.clone())
            } else if state.seeding.insert(key.clone()) {
                Seed::Fetch
            } else {
                Seed::InFlight
            }
        };

        match seed {
            Seed::Cached(value) => filter.deliver(&value),
            Seed::InFlight => {}
            Seed::Fetch => self.fetch_seed(connection, key),
        }
    }

    fn fetch_seed(self: &Arc<Self>, connection: &Connection, key: PropertyKey) {
        let on_reply = (Arc::downgrade(self), key.clone());
        let on_error = (Arc::downgrade(self), key.clone());
        connection
            .call(
                &self.context,
                &self.service,
                &self.path,
                PROPERTIES_INTERFACE,
                "Get",
                (key.0.as_str(), key.1.as_str()),
            )
            .on_arguments(move |arguments: &[WireValue]| {
                let (weak, key) = &on_reply;
                let Some(listener) = weak.upgrade() else {
                    return;
                };
                let value = arguments.first().cloned().map(WireValue::into_inner_variant);
                if value.is_none() {
                    warn!(
                        "Empty reply getting property ({} {} {}.{})",
                        listener.service, listener.path, key.0, key.1
                    );
                }
                listener.seeded(key, value);
            })
            .on_error(move |error| {
                let (weak, key) = &on_error;
                let Some(listener) = weak.upgrade() else {
                    return;
                };
                warn!(
                    "Failed to get property ({} {} {}.{}): {}",
                    listener.service, listener.path, key.0, key.1, error
                );
                listener.seeded(key, None);
            });
    }

    /// Complete a seed fetch. Skipped for the value if a change signal beat it.
    fn seeded(&self, key: &PropertyKey, value: Option<WireValue>) {
        let targets: Vec<Arc<Filter>> = {
            let mut state = self.state.lock();
            state.seeding.remove(key);
            let Some(value) = &value else {
                return;
            };
            if state.torn_down || state.values.contains_key(key) {
                return;
            }
            state.values.insert(key.clone(), value.clone());
            state
                .filters
                .iter()
                .filter(|f| f.key == *key && !f.seeded.load(Ordering::SeqCst))
                .cloned()
                .collect()
        };

        if let Some(value) = value {
            for filter in targets {
                filter.deliver(&value);
            }
        }
    }

    fn handle_signal(self: &Arc<Self>, signal: &SignalMessage) {
        let Some(interface) = signal.arguments.first().and_then(WireValue::as_str) else {
            warn!(
                "Malformed PropertiesChanged from ({} {})",
                self.service, self.path
            );
            return;
        };

        let changed: Vec<(String, WireValue)> = match signal.arguments.get(1) {
            Some(WireValue::Dict { entries, .. }) => entries
                .iter()
                .filter_map(|(name, value)| {
                    Some((name.as_str()?.to_string(), value.clone().into_inner_variant()))
                })
                .collect(),
            _ => Vec::new(),
        };
        let invalidated: Vec<String> = match signal.arguments.get(2) {
            Some(WireValue::Array { items, .. }) => items
                .iter()
                .filter_map(|name| name.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };

        self.properties_changed(interface, &changed, &invalidated);
    }

    /// Apply one `PropertiesChanged` notification.
    ///
    /// Changed values are delivered as carried. Invalidated properties are
    /// dropped from the cache and re-fetched; the fetched value is delivered
    /// when it arrives.
    pub fn properties_changed(
        self: &Arc<Self>,
        interface: &str,
        changed: &[(String, WireValue)],
        invalidated: &[String],
    ) {
        for (name, value) in changed {
            debug!(
                "DBus property changed ({} {} {}.{})",
                self.service, self.path, interface, name
            );
            self.property_changed(interface, name, value.clone());
        }

        for name in invalidated {
            debug!(
                "DBus property changed ({} {} {}.{})",
                self.service, self.path, interface, name
            );
            self.state
                .lock()
                .values
                .remove(&(interface.to_string(), name.clone()));
            self.refetch(interface, name);
        }
    }

    fn property_changed(&self, interface: &str, property: &str, value: WireValue) {
        let key = (interface.to_string(), property.to_string());
        let targets: Vec<Arc<Filter>> = {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            state.filters.retain(|f| f.context.is_alive());
            let targets: Vec<_> = state.filters.iter().filter(|f| f.key == key).cloned().collect();
            if !targets.is_empty() {
                state.values.insert(key, value.clone());
            }
            targets
        };

        for filter in targets {
            filter.deliver(&value);
        }
    }

    fn refetch(self: &Arc<Self>, interface: &str, property: &str) {
        if self.state.lock().torn_down {
            return;
        }
        let Some(inner) = self.connection.upgrade() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let key = (interface.to_string(), property.to_string());
        Connection::from_inner(inner)
            .call(
                &self.context,
                &self.service,
                &self.path,
                PROPERTIES_INTERFACE,
                "Get",
                (interface, property),
            )
            .on_arguments(move |arguments: &[WireValue]| {
                let (Some(listener), Some(value)) = (weak.upgrade(), arguments.first()) else {
                    return;
                };
                listener.property_changed(&key.0, &key.1, value.clone().into_inner_variant());
            });
    }

    /// Drop the match and every filter. Idempotent.
    pub(crate) fn teardown(&self) {
        let (filters, registration) = {
            let mut state = self.state.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.subscribers.clear();
            state.values.clear();
            state.seeding.clear();
            (std::mem::take(&mut state.filters), state.registration.take())
        };

        drop(filters);
        if let Some((token, transport)) = registration {
            if let Some(transport) = transport.upgrade() {
                transport.disconnect_signal(token);
            }
        }
        debug!("Property listener ({} {}) torn down", self.service, self.path);
    }
}

impl Drop for PropertyChanges {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for PropertyChanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyChanges")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("path", &self.path)
            .finish()
    }
}
