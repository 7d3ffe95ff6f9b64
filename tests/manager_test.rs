mod common;

use bytes::Bytes;
use common::{
    create_logger, echo_member, eventually, fast_config, member_with, next_event, BlockingHandler,
    SlowReconnector, StallFirstHandler,
};
use gridlink::server::InProcessNetwork;
use gridlink::{
    ClientConfig, CloseReason, ConnectionManager, InvocationError, InvocationOptions, JsonCodec,
    LifecycleEvent, Member, MemberId, ReconnectPolicy, Request, StaticMembership,
    StaticPartitionDirectory, UnavailablePolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

fn manager(config: ClientConfig, network: &Arc<InProcessNetwork>) -> ConnectionManager {
    ConnectionManager::new(config, network.clone(), &create_logger()).expect("valid config")
}

#[tokio::test]
async fn test_start_connects_every_member() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (a, _) = echo_member(&network, &logger).await;
    let (b, _) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![a.clone(), b.clone()])));

    let mut connected = Vec::new();
    for _ in 0..2 {
        match next_event(&mut events).await {
            LifecycleEvent::Connected { member, partition_channels, .. } => {
                assert_eq!(partition_channels, 3);
                connected.push(member);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    connected.sort();
    let mut expected = vec![a.id, b.id];
    expected.sort();
    assert_eq!(connected, expected);

    assert_eq!(manager.connection_count(), 2);
    assert!(manager.get_connection(a.id).is_some());
    assert!(manager.get_random_connection().is_some());
    manager.stop().await;
}

#[tokio::test]
async fn test_heartbeat_timeout_triggers_reconnection() {
    println!("=== Heartbeat timeout and reconnection ===");
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let handler = Arc::new(BlockingHandler { hold: Duration::from_secs(3) });
    let (member, _server) = member_with(&network, handler, &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));
    let first = manager.get_connection(member.id).expect("connected");

    println!("Step 1: block one partition channel on the member");
    let result = manager
        .send(Request::new("block").with_partition(5))
        .await;
    assert!(matches!(result, Err(InvocationError::TargetDisconnected { .. })));
    assert!(!first.is_alive());

    println!("Step 2: the connection is replaced");
    match next_event(&mut events).await {
        LifecycleEvent::Disconnected { member: id, reason } => {
            assert_eq!(id, member.id);
            match reason {
                CloseReason::SiblingClosed { cause, .. } => assert_eq!(*cause, CloseReason::HeartbeatTimeout),
                other => panic!("unexpected reason {:?}", other),
            }
        }
        other => panic!("unexpected event {:?}", other),
    }
    match next_event(&mut events).await {
        LifecycleEvent::Connected { member: id, partition_channels, .. } => {
            assert_eq!(id, member.id);
            assert_eq!(partition_channels, 3);
        }
        other => panic!("unexpected event {:?}", other),
    }

    let second = manager.get_connection(member.id).expect("reconnected");
    assert!(!second.same_as(&first));
    assert_eq!(second.partition_channel_count(), 3);
    assert_eq!(second.channels().len(), 4);
    assert!(second.channels().iter().all(|c| c.is_alive()));
    println!("✓ new connection with 3 partition channels + 1 generic channel");
    manager.stop().await;
}

#[tokio::test]
async fn test_protocol_violation_triggers_reconnection() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, server) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));

    server.corrupt_next_reply(gridlink::ChannelTarget::Partition(0));
    let result = manager.send(Request::new("get").with_partition(3)).await;
    assert!(matches!(result, Err(InvocationError::TargetDisconnected { .. })));

    assert!(matches!(
        next_event(&mut events).await,
        LifecycleEvent::Disconnected { reason: CloseReason::SiblingClosed { .. }, .. }
    ));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));

    let echoed = manager.send(Request::new("get").with_partition(3)).await.unwrap();
    assert_eq!(echoed, Bytes::from_static(b"get"));
    manager.stop().await;
}

#[tokio::test]
async fn test_retryable_request_is_resent_after_disconnect() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, server) = member_with(&network, Arc::new(StallFirstHandler::default()), &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));

    let sender = manager.clone();
    let pending = tokio::spawn(async move {
        sender.send(Request::new("put").with_partition(1).retryable()).await
    });

    eventually("first attempt reached the member", || server.request_count() == 1).await;
    manager
        .get_connection(member.id)
        .expect("connected")
        .close(CloseReason::Explicit("injected failure".to_string()));

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("retry should finish")
        .unwrap();
    assert_eq!(result.unwrap(), Bytes::from_static(b"put"));
    assert_eq!(server.request_count(), 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_retry_waits_for_replacement_under_fail_fast() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, server) = member_with(&network, Arc::new(StallFirstHandler::default()), &logger).await;

    // The first connection (generic + 3 partition channels) opens at once;
    // its replacement takes 300ms
    let connector = Arc::new(SlowReconnector::new(network.clone(), 4, Duration::from_millis(300)));
    let manager = ConnectionManager::new(
        fast_config().with_unavailable_policy(UnavailablePolicy::FailFast),
        connector,
        &logger,
    )
    .expect("valid config");
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));

    let sender = manager.clone();
    let pending = tokio::spawn(async move {
        sender.send(Request::new("put").with_partition(1).retryable()).await
    });

    eventually("first attempt reached the member", || server.request_count() == 1).await;
    manager
        .get_connection(member.id)
        .expect("connected")
        .close(CloseReason::Explicit("injected failure".to_string()));

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("retry should finish")
        .unwrap();
    assert_eq!(result.unwrap(), Bytes::from_static(b"put"));
    assert_eq!(server.request_count(), 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_non_retryable_request_fails_on_disconnect() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, server) = member_with(&network, Arc::new(StallFirstHandler::default()), &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send(Request::new("put").with_partition(1)).await });

    eventually("request reached the member", || server.request_count() == 1).await;
    manager
        .get_connection(member.id)
        .expect("connected")
        .close(CloseReason::Explicit("injected failure".to_string()));

    match pending.await.unwrap() {
        Err(InvocationError::TargetDisconnected { member: id, reason }) => {
            assert_eq!(id, member.id);
            assert_eq!(reason, "injected failure");
        }
        other => panic!("expected TargetDisconnected, got {:?}", other),
    }
    assert_eq!(server.request_count(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn test_retry_budget_is_bounded() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let handler = Arc::new(BlockingHandler { hold: Duration::from_secs(30) });
    let (member, server) = member_with(&network, handler, &logger).await;

    let manager = manager(fast_config(), &network);
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    eventually("connected", || manager.connection_count() == 1).await;

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send(Request::new("block").retryable()).await });

    // Kill every connection the request lands on; the retry policy allows three attempts
    for attempt in 1..=3 {
        eventually("attempt reached the member", || server.request_count() == attempt).await;
        eventually("connection available", || manager.connection_count() == 1).await;
        if let Some(connection) = manager.get_connection(member.id) {
            connection.close(CloseReason::Explicit(format!("kill {}", attempt)));
        }
    }

    let result = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(InvocationError::TargetDisconnected { .. })));
    assert_eq!(server.request_count(), 3);
    manager.stop().await;
}

#[tokio::test]
async fn test_fail_fast_without_connection() {
    let network = Arc::new(InProcessNetwork::new());
    let manager = manager(
        fast_config().with_unavailable_policy(UnavailablePolicy::FailFast),
        &network,
    );
    manager.start(Arc::new(StaticMembership::new(Vec::new())));

    let started = tokio::time::Instant::now();
    let result = manager.send(Request::new("get").with_partition(1)).await;
    assert!(matches!(result, Err(InvocationError::ConnectionUnavailable { .. })));
    assert!(started.elapsed() < Duration::from_millis(500));
    manager.stop().await;
}

#[tokio::test]
async fn test_await_policy_gives_up_after_limit() {
    let network = Arc::new(InProcessNetwork::new());
    let manager = manager(
        fast_config().with_unavailable_policy(UnavailablePolicy::Await(Duration::from_millis(150))),
        &network,
    );

    let started = tokio::time::Instant::now();
    let result = manager.send(Request::new("get")).await;
    assert!(matches!(result, Err(InvocationError::ConnectionUnavailable { .. })));
    assert!(started.elapsed() >= Duration::from_millis(150));
    manager.stop().await;
}

#[tokio::test]
async fn test_await_policy_waits_for_connection() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let membership = Arc::new(StaticMembership::new(Vec::new()));
    let manager = manager(
        fast_config().with_unavailable_policy(UnavailablePolicy::Await(Duration::from_secs(3))),
        &network,
    );
    manager.start(membership.clone());

    let sender = manager.clone();
    let pending = tokio::spawn(async move { sender.send(Request::new("hello").with_partition(8)).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let (member, _server) = echo_member(&network, &logger).await;
    membership.add_member(member);

    let result = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(result.unwrap(), Bytes::from_static(b"hello"));
    manager.stop().await;
}

#[tokio::test]
async fn test_member_removed_closes_connection_without_reconnect() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, server) = echo_member(&network, &logger).await;
    let membership = Arc::new(StaticMembership::new(vec![member.clone()]));

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(membership.clone());
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));
    let connection = manager.get_connection(member.id).unwrap();

    membership.remove_member(member.id);

    assert_eq!(
        next_event(&mut events).await,
        LifecycleEvent::Disconnected { member: member.id, reason: CloseReason::MemberRemoved }
    );
    assert!(!connection.is_alive());
    eventually("member sees channels dropped", || server.active_channels() == 0).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err(), "no reconnection for a removed member");
    assert_eq!(manager.connection_count(), 0);
    manager.stop().await;
}

#[tokio::test]
async fn test_explicit_disconnect_does_not_reconnect() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, _server) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));

    let reason = CloseReason::Explicit("maintenance".to_string());
    assert!(manager.disconnect(member.id, reason.clone()));
    assert_eq!(
        next_event(&mut events).await,
        LifecycleEvent::Disconnected { member: member.id, reason }
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert!(manager.get_connection(member.id).is_none());

    // An explicit connect brings it back
    let connection = manager.connect(member.clone()).await.unwrap();
    assert!(connection.is_alive());
    assert!(matches!(next_event(&mut events).await, LifecycleEvent::Connected { .. }));
    manager.stop().await;
}

#[tokio::test]
async fn test_disconnected_always_precedes_connected() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, _server) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));

    let replaced = |previous: &Option<gridlink::Connection>| {
        match (manager.get_connection(member.id), previous) {
            (Some(current), Some(previous)) => !current.same_as(previous),
            (Some(_), None) => true,
            (None, _) => false,
        }
    };

    let mut previous = None;
    for round in 0..3 {
        eventually("connected", || replaced(&previous)).await;
        let current = manager.get_connection(member.id).unwrap();
        current
            .generic_channel()
            .close(CloseReason::Io(format!("round {}", round)));
        previous = Some(current);
    }
    eventually("reconnected", || replaced(&previous)).await;

    let mut sequence = Vec::new();
    while let Ok(event) = events.try_recv() {
        sequence.push(event);
    }
    assert_eq!(sequence.len(), 7);
    for (index, event) in sequence.iter().enumerate() {
        let expect_connected = index % 2 == 0;
        match event {
            LifecycleEvent::Connected { .. } => assert!(expect_connected, "event {} out of order", index),
            LifecycleEvent::Disconnected { .. } => assert!(!expect_connected, "event {} out of order", index),
            other => panic!("unexpected event {:?}", other),
        }
    }
    manager.stop().await;
}

#[tokio::test]
async fn test_reconnect_budget_exhausted() {
    let network = Arc::new(InProcessNetwork::new());
    let config = fast_config().with_reconnect(ReconnectPolicy {
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(20),
        multiplier: 2.0,
        max_attempts: 3,
    });
    let manager = manager(config, &network);
    let mut events = manager.subscribe();

    let id = MemberId::new_random();
    manager.member_added(Member::new(id, InProcessNetwork::address_of(id)));

    assert_eq!(
        next_event(&mut events).await,
        LifecycleEvent::ReconnectFailed { member: id, attempts: 3 }
    );
    assert_eq!(manager.connection_count(), 0);
    manager.stop().await;
}

#[tokio::test]
async fn test_requests_follow_partition_owner() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (a, server_a) = echo_member(&network, &logger).await;
    let (b, server_b) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    manager.set_partition_directory(Arc::new(StaticPartitionDirectory::round_robin(10, &[a.id, b.id])));
    manager.start(Arc::new(StaticMembership::new(vec![a, b])));
    eventually("both connected", || manager.connection_count() == 2).await;

    // Even partitions belong to a, odd ones to b
    for pid in [0u32, 2, 4] {
        manager.send(Request::new("x").with_partition(pid)).await.unwrap();
    }
    manager.send(Request::new("x").with_partition(7)).await.unwrap();

    assert_eq!(server_a.request_count(), 3);
    assert_eq!(server_b.request_count(), 1);
    manager.stop().await;
}

#[tokio::test]
async fn test_unknown_owner_falls_back_to_any_connection() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, server) = echo_member(&network, &logger).await;

    let directory = Arc::new(StaticPartitionDirectory::new());
    directory.set_owner(3, MemberId::new_random());

    let manager = manager(fast_config(), &network);
    manager.set_partition_directory(directory);
    manager.start(Arc::new(StaticMembership::new(vec![member])));
    eventually("connected", || manager.connection_count() == 1).await;

    let echoed = manager.send(Request::new("fallback").with_partition(3)).await.unwrap();
    assert_eq!(echoed, Bytes::from_static(b"fallback"));
    assert_eq!(server.request_count(), 1);
    manager.stop().await;
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Put {
    key: String,
    value: u64,
}

#[derive(Debug, Deserialize)]
struct Count {
    #[allow(dead_code)]
    count: u64,
}

#[tokio::test]
async fn test_invoke_through_json_codec() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (member, _server) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    manager.start(Arc::new(StaticMembership::new(vec![member.clone()])));
    eventually("connected", || manager.connection_count() == 1).await;

    let op = Put { key: "k".to_string(), value: 42 };
    let codec: JsonCodec<Put, Put> = JsonCodec::new();
    let echoed = manager
        .invoke(&codec, &op, InvocationOptions::new().with_partition(2))
        .await
        .unwrap();
    assert_eq!(echoed, op);

    // The echoed body does not decode as a count; only this invocation fails
    let mismatched: JsonCodec<Put, Count> = JsonCodec::new();
    let result = manager.invoke(&mismatched, &op, InvocationOptions::new()).await;
    assert!(matches!(result, Err(InvocationError::Decode(_))));
    assert!(manager.get_connection(member.id).unwrap().is_alive());
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_closes_connections_and_rejects_requests() {
    let logger = create_logger();
    let network = Arc::new(InProcessNetwork::new());
    let (a, _) = echo_member(&network, &logger).await;
    let (b, _) = echo_member(&network, &logger).await;

    let manager = manager(fast_config(), &network);
    let mut events = manager.subscribe();
    manager.start(Arc::new(StaticMembership::new(vec![a, b])));
    eventually("both connected", || manager.connection_count() == 2).await;
    let connections = manager.get_active_connections();

    manager.stop().await;

    assert!(manager.is_shut_down());
    assert!(connections.iter().all(|c| !c.is_alive()));
    assert_eq!(manager.connection_count(), 0);

    let mut disconnected = 0;
    while let Ok(event) = events.try_recv() {
        if let LifecycleEvent::Disconnected { reason, .. } = event {
            assert_eq!(reason, CloseReason::Shutdown);
            disconnected += 1;
        }
    }
    assert_eq!(disconnected, 2);

    assert!(matches!(manager.send(Request::new("x")).await, Err(InvocationError::Shutdown)));
    assert!(matches!(
        manager.connect(Member::new(MemberId::new_random(), "node:x")).await,
        Err(gridlink::ConnectError::Shutdown)
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let network = Arc::new(InProcessNetwork::new());
    let config = ClientConfig::default().with_partition_channels(0);
    assert!(ConnectionManager::new(config, network, &create_logger()).is_err());
}
