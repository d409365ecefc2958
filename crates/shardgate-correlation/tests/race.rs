//! Resolve and timeout racing on the same ids.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shardgate_core::{ClientId, CorrelationId, GatewayError};
use shardgate_correlation::{PendingRegistry, RequestContext, RequestOrigin};

fn ctx() -> RequestContext {
    RequestContext::Gateway {
        client_id: ClientId::from("racer"),
        routing_key: "command.game.move".into(),
        origin: RequestOrigin::Websocket,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_completion_per_id() {
    let registry: PendingRegistry<u32> = PendingRegistry::in_memory("race");
    let resolved_wins = Arc::new(AtomicUsize::new(0));
    let mut waits = Vec::new();
    let mut resolvers = Vec::new();

    for i in 0..200u32 {
        let id = CorrelationId::from(format!("race-{i}"));
        let pending = registry
            .create_request(id.clone(), ctx(), Some(Duration::from_millis(2)))
            .await
            .unwrap();
        waits.push(tokio::spawn(pending.wait()));

        let registry = registry.clone();
        let wins = Arc::clone(&resolved_wins);
        resolvers.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(u64::from(i % 4))).await;
            if registry.resolve_request(&id, i).await {
                let _ = wins.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    for r in resolvers {
        r.await.unwrap();
    }

    let mut delivered = 0;
    let mut timed_out = 0;
    for w in waits {
        match w.await.unwrap() {
            Ok(_) => delivered += 1,
            Err(GatewayError::Timeout { .. }) => timed_out += 1,
            Err(other) => panic!("unexpected outcome: {other}"),
        }
    }

    assert_eq!(delivered + timed_out, 200);
    assert_eq!(delivered, resolved_wins.load(Ordering::SeqCst));
    assert!(registry.is_empty());
}

#[tokio::test(start_paused = true)]
async fn resolve_at_the_deadline_yields_one_outcome() {
    let registry: PendingRegistry<&'static str> = PendingRegistry::in_memory("race");
    let id = CorrelationId::from("edge");
    let pending = registry
        .create_request(id.clone(), ctx(), Some(Duration::from_millis(10)))
        .await
        .unwrap();

    let resolver = {
        let registry = registry.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            registry.resolve_request(&id, "answer").await
        })
    };

    let outcome = pending.wait().await;
    let resolver_won = resolver.await.unwrap();
    match outcome {
        Ok(resolved) => {
            assert!(resolver_won);
            assert_eq!(resolved.payload, "answer");
        }
        Err(GatewayError::Timeout { .. }) => assert!(!resolver_won),
        Err(other) => panic!("unexpected outcome: {other}"),
    }
    assert!(registry.is_empty());
}
