//! End-to-end bus-object scenarios over a real socket.

mod common;

use common::{TestBroker, TEST_BUS_ID};
use minibus_core::message::MessageKind;
use minibus_core::{Message, Value};

#[tokio::test]
async fn hello_returns_a_unique_name() {
    let broker = TestBroker::start().await;
    let mut client = broker.connect();
    client.authenticate(false).await;
    let unique = client.hello().await;

    assert!(unique.starts_with(":1."), "unexpected unique name {unique}");
    let suffix = unique.strip_prefix(":1.").unwrap();
    assert!(suffix.chars().all(|c| c.is_ascii_digit()));
}

#[tokio::test]
async fn anonymous_clients_can_say_hello_but_not_own_names() {
    let broker = TestBroker::start().await;
    let mut client = broker.connect();
    client.authenticate_anonymous().await;
    let unique = client.hello().await;
    assert!(unique.starts_with(":1."));

    // Anonymous peers get the unprivileged default policy.
    let reply = client
        .bus_call(
            "RequestName",
            vec![Value::String("com.example.Nope".into()), Value::UInt32(0)],
        )
        .await;
    assert_eq!(
        reply.error_name.as_deref(),
        Some("org.freedesktop.DBus.Error.AccessDenied")
    );
}

#[tokio::test]
async fn request_name_makes_the_caller_primary_owner() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let code = client.request_name("com.example.Svc", 0).await;
    assert_eq!(code, 1, "expected primary owner");

    let reply = client
        .bus_call(
            "GetNameOwner",
            vec![Value::String("com.example.Svc".into())],
        )
        .await;
    assert_eq!(reply.body[0].as_str(), Some(client.unique.as_str()));
}

#[tokio::test]
async fn calls_to_unknown_names_fail_with_service_unknown() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let reply = client
        .call(
            Message::method_call("/com/example", "Poke")
                .with_interface("com.example.Iface")
                .with_destination("com.example.Ghost"),
        )
        .await;

    assert_eq!(reply.kind(), MessageKind::Error);
    assert_eq!(
        reply.error_name.as_deref(),
        Some("org.freedesktop.DBus.Error.ServiceUnknown")
    );
    assert_eq!(reply.destination.as_deref(), Some(client.unique.as_str()));
    assert_eq!(reply.sender.as_deref(), Some("org.freedesktop.DBus"));
}

#[tokio::test]
async fn method_calls_route_between_peers() {
    let broker = TestBroker::start().await;
    let mut service = broker.client().await;
    let mut caller = broker.client().await;

    assert_eq!(service.request_name("com.example.Echo", 0).await, 1);

    let serial = caller
        .send(
            Message::method_call("/com/example/Echo", "Echo")
                .with_interface("com.example.Echo")
                .with_destination("com.example.Echo")
                .with_body_value(Value::String("ping".into())),
        )
        .await;

    // The service sees the call with the caller's unique name stamped.
    let inbound = service.next_message().await;
    assert_eq!(inbound.kind(), MessageKind::MethodCall);
    assert_eq!(inbound.sender.as_deref(), Some(caller.unique.as_str()));
    assert_eq!(inbound.body[0].as_str(), Some("ping"));

    // It replies; the caller correlates by serial.
    service
        .send(
            Message::method_return(inbound.serial)
                .with_destination(inbound.sender.clone().unwrap())
                .with_body_value(Value::String("pong".into())),
        )
        .await;

    let reply = caller.next_message().await;
    assert_eq!(reply.kind(), MessageKind::MethodReturn);
    assert_eq!(reply.reply_serial, Some(serial));
    assert_eq!(reply.body[0].as_str(), Some("pong"));
}

#[tokio::test]
async fn list_names_and_get_id() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;
    client.request_name("com.example.Listed", 0).await;

    let reply = client.bus_call("ListNames", vec![]).await;
    let Value::Array { items, .. } = &reply.body[0] else {
        panic!("expected array of names");
    };
    let names: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
    assert!(names.contains(&"org.freedesktop.DBus"));
    assert!(names.contains(&"com.example.Listed"));
    assert!(names.contains(&client.unique.as_str()));

    let reply = client.bus_call("GetId", vec![]).await;
    assert_eq!(reply.body[0].as_str(), Some(TEST_BUS_ID));
}

#[tokio::test]
async fn second_hello_is_rejected() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let reply = client
        .call(
            Message::method_call("/org/freedesktop/DBus", "Hello")
                .with_interface("org.freedesktop.DBus")
                .with_destination("org.freedesktop.DBus"),
        )
        .await;
    assert_eq!(reply.kind(), MessageKind::Error);
    assert_eq!(
        reply.error_name.as_deref(),
        Some("org.freedesktop.DBus.Error.Failed")
    );
}

#[tokio::test]
async fn introspection_and_peer_interfaces_respond() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;

    let reply = client
        .call(
            Message::method_call("/org/freedesktop/DBus", "Introspect")
                .with_interface("org.freedesktop.DBus.Introspectable")
                .with_destination("org.freedesktop.DBus"),
        )
        .await;
    assert!(reply.body[0]
        .as_str()
        .unwrap()
        .contains(r#"interface name="org.freedesktop.DBus""#));

    let reply = client
        .call(
            Message::method_call("/org/freedesktop/DBus", "Ping")
                .with_interface("org.freedesktop.DBus.Peer")
                .with_destination("org.freedesktop.DBus"),
        )
        .await;
    assert_eq!(reply.kind(), MessageKind::MethodReturn);
}
