//! Method call lifecycle over the in-process bus.

use busline::codec::ObjectPath;
use busline::{BusError, Connection, Context, Interface, MemoryBus, TypedArg, Value, WireValue};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SVC: &str = "org.example.svc";
const PATH: &str = "/org/example/svc";

fn service() -> MemoryBus {
    let bus = MemoryBus::new();
    bus.register_object(SVC, PATH)
        .method(SVC, "Ping", |_| Ok(vec![]))
        .method(SVC, "Add", |args| {
            let sum: i64 = args
                .iter()
                .map(|arg| match arg {
                    WireValue::Int32(v) => i64::from(*v),
                    _ => 0,
                })
                .sum();
            Ok(vec![WireValue::Int64(sum), WireValue::String("sum".into())])
        })
        .method(SVC, "Fail", |_| Err(BusError::failed("Nope")));
    bus
}

#[test]
fn test_ping_succeeds_with_no_arguments() {
    let bus = service();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let successes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let (s, e) = (successes.clone(), errors.clone());
    let call = connection.call(&context, SVC, PATH, SVC, "Ping", ());
    call.on_finished(move || {
        s.fetch_add(1, Ordering::SeqCst);
    })
    .on_error(move |_| {
        e.fetch_add(1, Ordering::SeqCst);
    });

    bus.dispatch();
    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert_eq!(call.reply(), Some(Ok(vec![])));
}

#[test]
fn test_unregistered_service_reports_error() {
    let bus = MemoryBus::new();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let call = connection.call(&context, SVC, PATH, SVC, "Ping", ());
    call.on_error(move |error| sink.lock().push(error));
    bus.dispatch();
    assert!(call.is_error());

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].is(BusError::SERVICE_UNKNOWN));
    assert!(errors[0].message.contains(SVC));
}

#[test]
fn test_method_error_is_forwarded() {
    let bus = service();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let call = connection.call(&context, SVC, PATH, SVC, "Fail", ());
    bus.dispatch();
    let error = call.error().unwrap();
    assert!(error.is(BusError::FAILED));
    assert_eq!(error.message, "Nope");
}

#[test]
fn test_typed_reply_arguments() {
    let bus = service();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    connection
        .call(&context, SVC, PATH, SVC, "Add", (2i32, 40i32))
        .on_finished(move |sum: i64, label: String| *sink.lock() = Some((sum, label)));
    bus.dispatch();

    assert_eq!(*seen.lock(), Some((42, "sum".to_string())));
}

#[test]
fn test_late_continuation_runs_once() {
    let bus = service();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let call = connection.call(&context, SVC, PATH, SVC, "Ping", ());
    bus.dispatch();
    assert!(call.is_finished());

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    call.on_finished(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    bus.dispatch();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroyed_context_suppresses_delivery_not_the_call() {
    let bus = service();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = delivered.clone();
    let call = connection.call(&context, SVC, PATH, SVC, "Ping", ());
    call.on_finished(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    drop(context);

    bus.dispatch();
    assert!(call.is_finished());
    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert_eq!(bus.call_count(SVC, PATH, SVC, "Ping"), 1);
}

#[test]
fn test_call_on_disconnected_transport_fails() {
    let bus = service();
    let transport = bus.connect();
    let connection = Connection::new(transport.clone());
    let context = Context::new();
    transport.disconnect();

    let call = connection.call(&context, SVC, PATH, SVC, "Ping", ());
    bus.dispatch();
    assert!(call.error().unwrap().is(BusError::DISCONNECTED));
    assert_eq!(bus.call_count(SVC, PATH, SVC, "Ping"), 0);
}

#[tokio::test]
async fn test_finished_future_and_blocking_call() {
    let bus = service();
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let call = connection.call(&context, SVC, PATH, SVC, "Add", (1i32, 2i32));
    bus.dispatch();
    let reply = call.finished().await.unwrap();
    assert_eq!(reply[0], WireValue::Int64(3));

    let reply = connection.blocking_call(SVC, PATH, SVC, "Add", (5i32,)).await.unwrap();
    assert_eq!(reply[0], WireValue::Int64(5));
}

#[test]
fn test_typed_and_dynamic_arguments() {
    let bus = MemoryBus::new();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.register_object(SVC, PATH).method(SVC, "Store", move |args| {
        sink.lock().extend(args.iter().map(WireValue::signature));
        Ok(vec![])
    });
    let iface = Interface::new(&Connection::new(bus.connect()), SVC, PATH, SVC);
    let context = Context::new();

    iface
        .typed_call(
            &context,
            "Store",
            &[
                TypedArg::new("o", "/org/example/item"),
                TypedArg::new("ay", Value::List(vec![Value::Int32(1), Value::Int32(2)])),
                TypedArg::new("v", 3),
            ],
        )
        .unwrap();
    bus.dispatch();
    assert_eq!(*received.lock(), vec!["o".to_string(), "ay".to_string(), "v".to_string()]);

    assert!(iface
        .typed_call(&context, "Store", &[TypedArg::new("y", 300)])
        .is_err());
    bus.dispatch();
    assert_eq!(bus.call_count(SVC, PATH, SVC, "Store"), 1);
}

#[test]
fn test_signals_are_normalized() {
    let bus = MemoryBus::new();
    let object = bus.register_object(SVC, PATH);
    let connection = Connection::new(bus.connect());
    let context = Context::new();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    assert!(connection.connect_to_signal(SVC, PATH, SVC, "Moved", &context, move |args: &[Value]| {
        sink.lock().push(args.to_vec());
    }));

    object.emit_signal(SVC, "Moved", (ObjectPath::from("/org/example/item"), vec![1u8, 2u8]));
    bus.dispatch();
    assert_eq!(
        *seen.lock(),
        vec![vec![
            Value::from("/org/example/item"),
            Value::List(vec![Value::Byte(1), Value::Byte(2)])
        ]]
    );
}
