//! Delivery modes across several relays sharing one transport, plus delegate
//! and trace propagation

use relay::{BusinessError, MemoryTransport, Relay, RelayConfig, Request};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

fn node(transport: &MemoryTransport, name: &str) -> Relay {
    let config = RelayConfig {
        name: name.to_string(),
        ..RelayConfig::default()
    };
    Relay::new(transport.clone(), config)
}

/// Register a handler answering with the relay's own name
async fn answer_with_name(relay: &Relay, pattern: Value) {
    relay
        .add(pattern, |req: Request| async move { Ok(json!(req.relay().config().name)) })
        .await
        .expect("register handler");
}

#[tokio::test]
async fn test_pubsub_reaches_every_subscriber() {
    let transport = MemoryTransport::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut subscribers = Vec::new();
    for name in ["a", "b", "c"] {
        let relay = node(&transport, name);
        let tx = tx.clone();
        relay
            .add(json!({"topic": "news", "pubsub$": true}), move |req: Request| {
                let headline = req.get("headline").and_then(Value::as_str).unwrap_or_default();
                let _ = tx.send((req.relay().config().name.clone(), headline.to_string()));
                async { Ok(Value::Null) }
            })
            .await
            .unwrap();
        subscribers.push(relay);
    }

    let publisher = node(&transport, "publisher");
    let result = publisher
        .act(json!({"topic": "news", "pubsub$": true, "headline": "hello"}))
        .await
        .unwrap();
    assert_eq!(result, Value::Null);

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("every subscriber should receive the broadcast")
            .unwrap();
        received.push(event);
    }
    received.sort();
    assert_eq!(
        received,
        vec![
            ("a".to_string(), "hello".to_string()),
            ("b".to_string(), "hello".to_string()),
            ("c".to_string(), "hello".to_string()),
        ]
    );
    // No inbox was opened for a fire-and-forget call
    assert_eq!(transport.subscription_count(Some("news")), 3);
    assert_eq!(transport.subscription_count(None), 3);
}

#[tokio::test]
async fn test_default_queue_group_balances_calls() {
    let transport = MemoryTransport::new();
    let first = node(&transport, "first");
    let second = node(&transport, "second");
    answer_with_name(&first, json!({"topic": "email", "cmd": "send"})).await;
    answer_with_name(&second, json!({"topic": "email", "cmd": "send"})).await;

    let client = node(&transport, "client");
    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    for _ in 0..4 {
        let who = client
            .act(json!({"topic": "email", "cmd": "send"}))
            .await
            .unwrap();
        *tally.entry(who.as_str().unwrap().to_string()).or_default() += 1;
    }

    assert_eq!(tally.get("first"), Some(&2));
    assert_eq!(tally.get("second"), Some(&2));
}

#[tokio::test]
async fn test_custom_queue_groups_each_receive_a_copy() {
    let transport = MemoryTransport::new();
    let a = node(&transport, "A");
    let b = node(&transport, "B");
    answer_with_name(&a, json!({"topic": "email", "cmd": "send", "queue$": "A"})).await;
    answer_with_name(&b, json!({"topic": "email", "cmd": "send", "queue$": "B"})).await;

    let client = node(&transport, "client");
    let replies: Vec<Value> = futures::StreamExt::collect::<Vec<_>>(
        client
            .act_stream(json!({"topic": "email", "cmd": "send", "maxMessages$": 2}))
            .await
            .unwrap(),
    )
    .await
    .into_iter()
    .map(Result::unwrap)
    .collect();

    let mut names: Vec<&str> = replies.iter().filter_map(Value::as_str).collect();
    names.sort();
    assert_eq!(names, vec!["A", "B"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_custom_queue_is_not_shadowed_by_default_group() {
    let transport = MemoryTransport::new();
    let relay = node(&transport, "svc");
    answer_with_name(&relay, json!({"topic": "email", "cmd": "send", "queue$": "zz"})).await;
    relay
        .add(json!({"topic": "email", "cmd": "stats"}), |_| async { Ok(json!(0)) })
        .await
        .unwrap();

    let client = node(&transport, "client");
    for _ in 0..50 {
        let reply = client.act(json!({"topic": "email", "cmd": "send"})).await;
        assert_eq!(reply.unwrap(), json!("svc"));
    }

    let err = client.act(json!({"topic": "email", "cmd": "archive"})).await.unwrap_err();
    assert_eq!(err.code(), "ERR_PATTERN_NOT_FOUND");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_more_specific_route_answers() {
    let transport = MemoryTransport::new();
    let relay = node(&transport, "svc");
    relay
        .add(json!({"topic": "email"}), |_| async { Ok(json!("generic")) })
        .await
        .unwrap();
    relay
        .add(json!({"topic": "email", "cmd": "send", "queue$": "A"}), |_| async {
            Ok(json!("specific"))
        })
        .await
        .unwrap();

    let client = node(&transport, "client");
    for _ in 0..20 {
        let reply = client.act(json!({"topic": "email", "cmd": "send"})).await.unwrap();
        assert_eq!(reply, json!("specific"));
    }
    let reply = client.act(json!({"topic": "email", "cmd": "other"})).await.unwrap();
    assert_eq!(reply, json!("generic"));
}

#[tokio::test]
async fn test_delegate_travels_one_hop() {
    let transport = MemoryTransport::new();
    let relay = node(&transport, "svc");

    relay
        .add(json!({"topic": "math", "cmd": "sub"}), |req: Request| async move {
            Ok(req.delegate().cloned().unwrap_or(Value::Null))
        })
        .await
        .unwrap();
    relay
        .add(json!({"topic": "math", "cmd": "add"}), |req: Request| async move {
            let outer = req.delegate().cloned();
            let inner = req.act(json!({"topic": "math", "cmd": "sub"})).await?;
            let explicit = req
                .act(json!({"topic": "math", "cmd": "sub", "delegate$": {"token": "t2"}}))
                .await?;
            Ok::<_, BusinessError>(json!({"outer": outer, "inner": inner, "explicit": explicit}))
        })
        .await
        .unwrap();

    let reply = relay
        .act(json!({"topic": "math", "cmd": "add", "delegate$": {"name": "test"}}))
        .await
        .unwrap();

    assert_eq!(reply["outer"], json!({"name": "test"}));
    assert_eq!(reply["inner"], Value::Null);
    assert_eq!(reply["explicit"], json!({"token": "t2"}));
}

#[tokio::test]
async fn test_delegate_is_not_part_of_the_pattern() {
    let transport = MemoryTransport::new();
    let relay = node(&transport, "svc");
    relay
        .add(json!({"topic": "math", "cmd": "add"}), |req: Request| async move {
            Ok(json!(req.pattern().method()))
        })
        .await
        .unwrap();

    let method = relay
        .act(json!({"topic": "math", "cmd": "add", "a": 1, "delegate$": {"name": "test"}}))
        .await
        .unwrap();
    assert_eq!(method, json!("a:1,cmd:add,topic:math"));
}

#[tokio::test]
async fn test_trace_spans_nested_calls() {
    let transport = MemoryTransport::new();
    let relay = node(&transport, "svc");

    relay
        .add(json!({"topic": "trace", "cmd": "inner"}), |req: Request| async move {
            let trace = &req.context().trace;
            Ok(json!({"trace_id": trace.trace_id, "parent": trace.parent_span_id}))
        })
        .await
        .unwrap();
    relay
        .add(json!({"topic": "trace", "cmd": "outer"}), |req: Request| async move {
            let inner = req.act(json!({"topic": "trace", "cmd": "inner"})).await?;
            let trace = &req.context().trace;
            Ok::<_, BusinessError>(json!({
                "trace_id": trace.trace_id,
                "span_id": trace.span_id,
                "inner": inner,
            }))
        })
        .await
        .unwrap();

    let reply = relay.act(json!({"topic": "trace", "cmd": "outer"})).await.unwrap();
    assert_eq!(reply["trace_id"], reply["inner"]["trace_id"]);
    assert_eq!(reply["span_id"], reply["inner"]["parent"]);
}
