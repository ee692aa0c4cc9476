mod common;

use std::time::Duration;

use common::{test_config, ScriptedFactory, ScriptedNode};
use topic_messenger::config::{MessengerConfig, RetryPolicy};
use topic_messenger::error::MessengerError;
use topic_messenger::interfaces::transport::NodeMode;
use topic_messenger::services::connection::{ConnectionManager, ConnectionState};
use topic_messenger::TopicMessenger;

const PEER_ONE: &str = "/ip4/10.0.0.1/tcp/1";
const PEER_TWO: &str = "/ip4/10.0.0.2/tcp/2";

#[tokio::test(start_paused = true)]
async fn failed_peer_is_skipped_and_init_still_succeeds() {
    let node = ScriptedNode::new();
    node.fail_dial(PEER_ONE, usize::MAX);
    node.fail_dial(PEER_TWO, 2);
    let factory = ScriptedFactory::new(node.clone());
    let config = MessengerConfig {
        static_peers: format!("{PEER_ONE},{PEER_TWO}"),
        ..test_config()
    };
    let messenger = TopicMessenger::new(config, factory.clone());

    let started = tokio::time::Instant::now();
    messenger.init().await.unwrap();

    assert_eq!(messenger.connection_state().await, ConnectionState::Ready);
    assert_eq!(factory.modes(), vec![NodeMode::StaticPeers]);
    assert_eq!(node.count(&format!("dial:{PEER_ONE}")), 5);
    assert_eq!(node.count(&format!("dial:{PEER_TWO}")), 3);
    // 4 delays between peer one's attempts, 2 before peer two succeeds
    assert!(started.elapsed() >= Duration::from_millis(3000));

    let calls = node.calls();
    let start_at = calls.iter().position(|c| c == "start").unwrap();
    let last_dial = calls.iter().rposition(|c| c.starts_with("dial:")).unwrap();
    assert!(last_dial < start_at);
}

#[tokio::test(start_paused = true)]
async fn empty_peer_list_uses_bootstrap_discovery() {
    let node = ScriptedNode::new();
    let factory = ScriptedFactory::new(node.clone());
    let messenger = TopicMessenger::new(test_config(), factory.clone());

    messenger.init().await.unwrap();

    assert_eq!(factory.modes(), vec![NodeMode::Bootstrap]);
    assert_eq!(node.count("dial:"), 0);
    assert_eq!(node.count("wait"), 1);
}

#[tokio::test(start_paused = true)]
async fn readiness_retries_until_peers_appear() {
    let node = ScriptedNode::new();
    node.fail_waits(2);
    let messenger = TopicMessenger::new(test_config(), ScriptedFactory::new(node.clone()));

    let started = tokio::time::Instant::now();
    messenger.init().await.unwrap();

    assert_eq!(node.count("wait"), 3);
    assert!(started.elapsed() >= Duration::from_millis(1000));
    assert_eq!(messenger.connection_state().await, ConnectionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn init_fails_after_ping_budget_is_spent() {
    let node = ScriptedNode::new();
    node.never_ready();
    let messenger = TopicMessenger::new(test_config(), ScriptedFactory::new(node.clone()));

    let err = messenger.init().await.unwrap_err();
    assert!(matches!(err, MessengerError::Connectivity(_)));
    assert!(err.to_string().contains("no remote peer found after max attempts"));
    assert_eq!(node.count("wait"), 3);
    assert_eq!(messenger.connection_state().await, ConnectionState::Failed);

    let (handler, _rx) = common::channel_handler();
    let err = messenger.subscribe("room", handler).await.unwrap_err();
    assert!(matches!(err, MessengerError::Connectivity(_)));
}

#[tokio::test(start_paused = true)]
async fn disconnected_node_is_not_ready_even_if_wait_succeeds() {
    let node = ScriptedNode::new();
    node.set_disconnected();
    let messenger = TopicMessenger::new(test_config(), ScriptedFactory::new(node.clone()));

    assert!(matches!(
        messenger.init().await,
        Err(MessengerError::Connectivity(_))
    ));
    assert_eq!(node.count("wait"), 3);
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent_and_safe_before_init() {
    let node = ScriptedNode::new();
    let manager = ConnectionManager::new(
        ScriptedFactory::new(node.clone()),
        RetryPolicy::default(),
    );
    manager.stop().await.unwrap();
    assert_eq!(node.count("stop"), 0);
    assert_eq!(manager.state().await, ConnectionState::Uninitialized);

    manager.init(&[], 1).await.unwrap();
    manager.stop().await.unwrap();
    manager.stop().await.unwrap();
    assert_eq!(node.count("stop"), 1);
    assert_eq!(manager.state().await, ConnectionState::Stopped);
    assert!(manager.ready_node().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn second_init_after_success_is_a_no_op() {
    let node = ScriptedNode::new();
    let factory = ScriptedFactory::new(node.clone());
    let manager = ConnectionManager::new(factory.clone(), RetryPolicy::default());

    manager.init(&[], 2).await.unwrap();
    manager.init(&[], 2).await.unwrap();

    assert_eq!(factory.modes().len(), 1);
    assert_eq!(node.count("start"), 1);
}
