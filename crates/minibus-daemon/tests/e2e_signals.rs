//! Signal fan-out and name-ownership signal scenarios.

mod common;

use std::time::Duration;

use common::TestBroker;
use minibus_core::message::MessageKind;
use minibus_core::{Message, Value};

const NAME: &str = "com.example.Svc";

#[tokio::test]
async fn match_rules_select_exactly_the_matching_signals() {
    let broker = TestBroker::start().await;
    let mut subscriber = broker.client().await;
    let mut emitter = broker.client().await;
    let mut other = broker.client().await;

    subscriber
        .add_match("type='signal',interface='com.x',member='Y'")
        .await;

    // A matching signal from one peer, a non-matching one from another.
    emitter
        .send(Message::signal("/com/x/Obj", "com.x", "Y"))
        .await;
    other
        .send(Message::signal("/com/x/Obj", "com.other", "Y"))
        .await;

    let received = subscriber.next_message().await;
    assert_eq!(received.kind(), MessageKind::Signal);
    assert_eq!(received.interface.as_deref(), Some("com.x"));
    assert_eq!(received.member.as_deref(), Some("Y"));
    assert_eq!(received.sender.as_deref(), Some(emitter.unique.as_str()));

    // The non-matching signal must never show up.
    subscriber.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn peers_without_rules_get_nothing_by_default() {
    let broker = TestBroker::start().await;
    let mut bystander = broker.client().await;
    let mut emitter = broker.client().await;

    emitter
        .send(Message::signal("/com/x/Obj", "com.x", "Y"))
        .await;

    bystander.expect_silence(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn compat_broadcast_delivers_to_ruleless_peers() {
    let broker = TestBroker::start_with(|config| config.compat_broadcast = true).await;
    let mut bystander = broker.client().await;
    let mut emitter = broker.client().await;

    emitter
        .send(Message::signal("/com/x/Obj", "com.x", "Y"))
        .await;

    let received = bystander.next_message().await;
    assert_eq!(received.member.as_deref(), Some("Y"));
}

#[tokio::test]
async fn queued_owner_takes_over_with_a_single_transfer_signal() {
    let broker = TestBroker::start().await;
    let mut a = broker.client().await;
    let mut b = broker.client().await;
    let mut watcher = broker.client().await;

    watcher
        .add_match("type='signal',member='NameOwnerChanged'")
        .await;

    assert_eq!(a.request_name(NAME, 0).await, 1); // primary owner
    let acquired = watcher.next_message().await;
    assert_eq!(acquired.body[0].as_str(), Some(NAME));
    assert_eq!(acquired.body[1].as_str(), Some(""));
    assert_eq!(acquired.body[2].as_str(), Some(a.unique.as_str()));

    assert_eq!(b.request_name(NAME, 0).await, 2); // in queue

    assert_eq!(a.release_name(NAME).await, 1); // released

    // Exactly one NameOwnerChanged: a direct transfer from A to B, no
    // intermediate release to nobody.
    let transfer = watcher.next_message().await;
    assert_eq!(transfer.member.as_deref(), Some("NameOwnerChanged"));
    assert_eq!(transfer.body[0].as_str(), Some(NAME));
    assert_eq!(transfer.body[1].as_str(), Some(a.unique.as_str()));
    assert_eq!(transfer.body[2].as_str(), Some(b.unique.as_str()));
    watcher.expect_silence(Duration::from_millis(200)).await;

    // B is now the resolvable owner.
    let reply = b
        .bus_call("GetNameOwner", vec![Value::String(NAME.into())])
        .await;
    assert_eq!(reply.body[0].as_str(), Some(b.unique.as_str()));
}

#[tokio::test]
async fn disconnect_promotes_the_queue_head() {
    let broker = TestBroker::start().await;
    let mut a = broker.client().await;
    let mut b = broker.client().await;
    let mut watcher = broker.client().await;

    watcher
        .add_match(&format!("type='signal',member='NameOwnerChanged',arg0='{NAME}'"))
        .await;

    assert_eq!(a.request_name(NAME, 0).await, 1);
    let first = watcher.next_message().await;
    assert_eq!(first.body[2].as_str(), Some(a.unique.as_str()));

    assert_eq!(b.request_name(NAME, 0).await, 2);
    drop(a); // socket closes; the broker tears the peer down

    let transfer = watcher.next_message().await;
    assert_eq!(transfer.body[0].as_str(), Some(NAME));
    assert_eq!(transfer.body[2].as_str(), Some(b.unique.as_str()));
}

#[tokio::test]
async fn replacement_flags_move_ownership_immediately() {
    let broker = TestBroker::start().await;
    let mut a = broker.client().await;
    let mut b = broker.client().await;

    // ALLOW_REPLACEMENT = 1, REPLACE_EXISTING = 2.
    assert_eq!(a.request_name(NAME, 1).await, 1);
    assert_eq!(b.request_name(NAME, 2).await, 1);

    let reply = b
        .bus_call("GetNameOwner", vec![Value::String(NAME.into())])
        .await;
    assert_eq!(reply.body[0].as_str(), Some(b.unique.as_str()));
}

#[tokio::test]
async fn request_then_release_round_trips_the_registry() {
    let broker = TestBroker::start().await;
    let mut client = broker.client().await;
    let mut watcher = broker.client().await;
    watcher
        .add_match(&format!("type='signal',member='NameOwnerChanged',arg0='{NAME}'"))
        .await;

    assert_eq!(client.request_name(NAME, 0).await, 1);
    assert_eq!(client.release_name(NAME).await, 1);

    // Two signals with inverse payloads.
    let acquired = watcher.next_message().await;
    let released = watcher.next_message().await;
    assert_eq!(acquired.body[1].as_str(), released.body[2].as_str());
    assert_eq!(acquired.body[2].as_str(), released.body[1].as_str());

    // And the name is gone.
    let reply = client
        .bus_call("NameHasOwner", vec![Value::String(NAME.into())])
        .await;
    assert_eq!(reply.body[0], Value::Boolean(false));
}

#[tokio::test]
async fn signal_sender_is_stamped() {
    let broker = TestBroker::start().await;
    let mut subscriber = broker.client().await;
    let mut emitter = broker.client().await;

    subscriber.add_match("type='signal',interface='com.x'").await;

    // A forged sender is overwritten by the broker.
    emitter
        .send(
            Message::signal("/com/x/Obj", "com.x", "Y").with_sender(":1.31337"),
        )
        .await;

    let received = subscriber.next_message().await;
    assert_eq!(received.sender.as_deref(), Some(emitter.unique.as_str()));
}
