//! Routing through the gateway topology on the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;
use shardgate_broker::topology::{
    AUTH_COMMANDS, COORDINATOR_COMMANDS, GATEWAY_EVENTS, GATEWAY_NOTIFICATIONS, GATEWAY_RESPONSES,
    SYSTEM_COMMANDS,
};
use shardgate_broker::{AdapterConfig, BrokerAdapter, InMemoryBroker, MessageBroker, Topology};
use shardgate_core::routing::{ADMIN_NOTIFICATION_KEY, COMMANDS_EXCHANGE, EVENTS_EXCHANGE};
use shardgate_core::{CorrelationId, Envelope, EnvelopeType};

async fn gateway() -> (Arc<InMemoryBroker>, Arc<BrokerAdapter>) {
    let broker = Arc::new(InMemoryBroker::new());
    let adapter = BrokerAdapter::connect(broker.clone(), Topology::gateway(), AdapterConfig::default())
        .await
        .unwrap();
    (broker, adapter)
}

async fn receive_key(broker: &InMemoryBroker, queue: &str) -> String {
    let mut stream = broker.subscribe(queue).await.unwrap();
    let delivery = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    let key = delivery.routing_key.clone();
    delivery.ack().await.unwrap();
    key
}

#[tokio::test]
async fn command_domains_reach_their_worker_queues() {
    let (broker, adapter) = gateway().await;
    let cases = [
        ("command.auth.login", AUTH_COMMANDS),
        ("command.coordinator.move", COORDINATOR_COMMANDS),
        ("command.system.ping", SYSTEM_COMMANDS),
        ("command.shard.assign", SYSTEM_COMMANDS),
        ("command.discord.link", SYSTEM_COMMANDS),
    ];
    for (key, queue) in cases {
        let n = adapter
            .publish_json(COMMANDS_EXCHANGE, key, &json!({}))
            .await
            .unwrap();
        assert_eq!(n, 1, "{key}");
        assert_eq!(receive_key(&broker, queue).await, key);
    }
}

#[tokio::test]
async fn events_exchange_splits_responses_events_and_notifications() {
    let (broker, adapter) = gateway().await;
    let env = Envelope::new(EnvelopeType::Response, CorrelationId::new(), json!({}));

    let _ = adapter
        .publish_envelope(EVENTS_EXCHANGE, "response.auth.login", &env)
        .await
        .unwrap();
    let _ = adapter
        .publish_envelope(EVENTS_EXCHANGE, "event.world.tick", &env)
        .await
        .unwrap();
    let _ = adapter
        .publish_envelope(EVENTS_EXCHANGE, ADMIN_NOTIFICATION_KEY, &env)
        .await
        .unwrap();

    assert_eq!(receive_key(&broker, GATEWAY_RESPONSES).await, "response.auth.login");
    assert_eq!(receive_key(&broker, GATEWAY_EVENTS).await, "event.world.tick");
    assert_eq!(receive_key(&broker, GATEWAY_NOTIFICATIONS).await, ADMIN_NOTIFICATION_KEY);
}

#[tokio::test]
async fn unknown_command_domain_is_unroutable() {
    let (_broker, adapter) = gateway().await;
    let res = adapter
        .publish_json(COMMANDS_EXCHANGE, "command.nobody.here", &json!({}))
        .await;
    assert!(matches!(res, Err(shardgate_core::GatewayError::Unroutable { .. })));
}

proptest! {
    #[test]
    fn published_body_arrives_unchanged(n in any::<i64>(), s in "[a-z]{0,12}") {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (broker, adapter) = gateway().await;
            let body = json!({"n": n, "s": s});
            let _ = adapter.publish_json(EVENTS_EXCHANGE, "event.x.y", &body).await.unwrap();
            let mut stream = broker.subscribe(GATEWAY_EVENTS).await.unwrap();
            let delivery = stream.next().await.unwrap();
            let got: serde_json::Value = delivery.message.decode().unwrap();
            delivery.ack().await.unwrap();
            assert_eq!(got, body);
        });
    }
}
