//! Guaranteed stacks across link loss, over in-memory connections.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::UnboundedReceiver;

use relink::client::ClientStack;
use relink::identity::ConnectionIdFactory;
use relink::prelude::*;
use relink::stack::{GuaranteedHarnessFactory, HarnessFactory, ServerStackProvider};
use relink::transport::{ConnectionHandler, Scheduler};

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn reconnect_config() -> ReconnectConfig {
    ReconnectConfig::builder()
        .enabled(true)
        .timeout(Duration::from_secs(5))
        .build()
}

fn provider(server_id: &str) -> (Arc<ServerStackProvider>, UnboundedReceiver<AcceptedChannel>) {
    let factory: Arc<dyn HarnessFactory> =
        Arc::new(GuaranteedHarnessFactory::new(reconnect_config()));
    ServerStackProvider::new(
        factory,
        Scheduler::current(),
        ConnectionIdFactory::with_server_id(server_id),
        ConnectionPolicy::new(0),
    )
}

/// Connector whose far ends go to whichever provider is current.
fn connector(target: Arc<RwLock<Arc<ServerStackProvider>>>) -> Arc<MemoryConnector> {
    Arc::new(MemoryConnector::new(move |connection| {
        let handler: Arc<dyn ConnectionHandler> = target.read().clone();
        connection.set_handler(Arc::downgrade(&handler));
    }))
}

async fn next_message(events: &mut UnboundedReceiver<ChannelEvent>) -> Bytes {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("message in time")
            .expect("channel open");
        if let ChannelEvent::Message(body) = event {
            return body;
        }
    }
}

fn body(i: usize) -> Bytes {
    Bytes::from(format!("msg-{i}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_survive_link_loss_exactly_once() {
    let _ = tracing_subscriber::fmt::try_init();
    let (server, mut accepted) = provider("srv-a");
    let target = Arc::new(RwLock::new(server.clone()));
    let connector = connector(target);

    let (client, _client_events) = ClientStack::builder()
        .jvm_id("jvm-1")
        .reconnect(reconnect_config())
        .retry_interval(Duration::from_millis(20))
        .connector(connector.clone())
        .build()
        .unwrap();
    client.connect().await.unwrap();
    eventually("handshake", || client.is_connected()).await;
    let mut peer = accepted.recv().await.unwrap();

    for i in 0..20 {
        client.send(body(i)).unwrap();
    }
    for i in 0..10 {
        assert_eq!(next_message(&mut peer.events).await, body(i));
    }

    connector.sever();
    eventually("link loss noticed", || !client.stack().transport().is_connected()).await;
    for i in 20..40 {
        client.send(body(i)).unwrap();
    }
    eventually("resume", || client.is_connected()).await;

    for i in 10..40 {
        assert_eq!(next_message(&mut peer.events).await, body(i));
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = peer.events.try_recv() {
        assert!(
            !matches!(event, ChannelEvent::Message(_)),
            "duplicate delivery: {event:?}"
        );
    }

    peer.channel.send(Bytes::from_static(b"reply")).unwrap();
    assert_eq!(server.stack_count(), 1);
    assert!(accepted.try_recv().is_err());
    client.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restarted_server_resets_session() {
    let _ = tracing_subscriber::fmt::try_init();
    let (first, mut first_accepted) = provider("srv-b");
    let target = Arc::new(RwLock::new(first.clone()));
    let connector = connector(target.clone());

    let (client, mut client_events) = ClientStack::builder()
        .jvm_id("jvm-2")
        .reconnect(reconnect_config())
        .retry_interval(Duration::from_millis(20))
        .connector(connector)
        .build()
        .unwrap();
    let id = client.connect().await.unwrap();
    eventually("handshake", || client.is_connected()).await;
    let mut peer = first_accepted.recv().await.unwrap();
    client.send(body(0)).unwrap();
    assert_eq!(next_message(&mut peer.events).await, body(0));
    let old_session = client.stack().ooo().unwrap().session();

    // Same server id, fresh delivery state.
    let (second, mut second_accepted) = provider("srv-b");
    second.prebuild([id.clone()]).unwrap();
    *target.write() = second.clone();
    let mut resumed = second_accepted.recv().await.unwrap();
    first.shutdown();

    let mut reset = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), client_events.recv())
            .await
            .expect("event in time")
            .expect("channel open");
        match event {
            ChannelEvent::Transport {
                event: TransportEvent::Disconnected { forced: false },
                ..
            } => reset = true,
            ChannelEvent::Transport {
                event: TransportEvent::Connected,
                ..
            } if reset => break,
            _ => {}
        }
    }
    let server_stack = second.stack(&id).unwrap();
    let session = client.stack().ooo().unwrap().session();
    assert_ne!(session, old_session);
    assert_eq!(session, server_stack.ooo().unwrap().session());

    client.send(body(1)).unwrap();
    assert_eq!(next_message(&mut resumed.events).await, body(1));
}
