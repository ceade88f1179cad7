//! End-to-end tests for `GraphQLSocket` over the in-memory socket pair.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{options, settle};
use gqlsocket::protocol::Variables;
use gqlsocket::socket::memory::{self, MemoryServer, ServerConnection};
use gqlsocket::socket::SocketFrame;
use gqlsocket::{
    CloseInfo, GraphQLSocket, MultiplexError, OperationId, RequestOptions, RetryLimit,
    RetryPolicy, TransportOptions,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn vars(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

async fn open_client(limit: RetryLimit) -> (GraphQLSocket, MemoryServer, ServerConnection) {
    let (connector, mut server) = memory::pair();
    let client = GraphQLSocket::with_connector(options(limit), connector);
    client.wait_open().await.unwrap();
    let conn = server.accept().await.unwrap();
    (client, server, conn)
}

#[tokio::test(start_paused = true)]
async fn test_subscription_envelope_and_values() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let request = RequestOptions::body("subscription Main($every: Int) { tick(every: $every) }")
        .op("Main")
        .vars(vars(json!({"every": 5})));
    let (id, mut values) = client.subscribe_channel(request).unwrap();
    assert_eq!(id, OperationId(0));

    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({
            "type": "sub",
            "query": "subscription Main($every: Int) { tick(every: $every) }",
            "operation": "Main",
            "variables": {"every": 5},
            "id": 0
        })
    );

    conn.send_json(&json!({"id": 0, "value": {"data": {"tick": 1}}}));
    conn.send_json(&json!({"id": 0, "done": false, "value": {"data": {"tick": 2}}}));

    let first = values.recv().await.unwrap();
    assert_eq!(first.data, Some(json!({"tick": 1})));
    assert!(first.is_ok());
    assert_eq!(values.recv().await.unwrap().data, Some(json!({"tick": 2})));
    assert_eq!(client.subscription_ids(), vec![OperationId(0)]);
}

#[tokio::test(start_paused = true)]
async fn test_persisted_operations_use_id_envelopes() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    client.subscribe(RequestOptions::name("Ticks"), |_| {}).unwrap();
    client.query(RequestOptions::name("Viewer"), |_| {}).unwrap();

    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({"type": "subId", "query": "Ticks", "id": 0})
    );
    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({"type": "queryId", "query": "Viewer", "id": 1})
    );
}

#[tokio::test(start_paused = true)]
async fn test_ids_are_shared_across_operation_kinds() {
    let (client, _server, _conn) = open_client(RetryLimit::Unlimited).await;

    let first = client.subscribe(RequestOptions::body("subscription { a }"), |_| {}).unwrap();
    let second = client.query(RequestOptions::body("{ b }"), |_| {}).unwrap();
    let third = client.subscribe(RequestOptions::body("subscription { c }"), |_| {}).unwrap();

    assert_eq!(
        (first, second, third),
        (OperationId(0), OperationId(1), OperationId(2))
    );
    assert_eq!(client.subscription_count(), 2);
    assert_eq!(client.query_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_descriptor_is_rejected() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let missing = client.query(RequestOptions::default(), |_| {});
    assert!(matches!(missing, Err(MultiplexError::InvalidDescriptor(_))));

    let both = RequestOptions {
        query: Some("{ a }".into()),
        id: Some("A".into()),
        ..RequestOptions::default()
    };
    let ambiguous = client.subscribe(both, |_| {});
    assert!(matches!(ambiguous, Err(MultiplexError::InvalidDescriptor(_))));

    settle().await;
    assert_eq!(conn.try_recv(), None);
    assert_eq!(client.subscription_count(), 0);
    assert_eq!(client.query_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_query_async_returns_value_once() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (result, ()) = tokio::join!(client.query_async(RequestOptions::body("{ viewer }")), async {
        let frame = conn.recv_json().await.unwrap();
        assert_eq!(frame["type"], "query");
        conn.send_json(&json!({"id": frame["id"], "value": {"data": {"viewer": "ada"}}}));
    });

    assert_eq!(result.unwrap().data, Some(json!({"viewer": "ada"})));
    assert_eq!(client.query_count(), 0);

    // A late duplicate for the same id is ignored
    conn.send_json(&json!({"id": 0, "value": {"data": {"viewer": "again"}}}));
    settle().await;
    assert_eq!(client.query_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_query_errors_are_delivered_as_values() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (result, ()) = tokio::join!(client.query_async(RequestOptions::body("{ a }")), async {
        conn.recv_json().await.unwrap();
        conn.send_json(&json!({
            "id": 0,
            "value": {"errors": [{"message": "boom", "path": ["a", 0]}]}
        }));
    });

    let response = result.unwrap();
    assert!(!response.is_ok());
    let errors = response.errors.unwrap();
    assert_eq!(errors[0].message, "boom");
    assert_eq!(errors[0].path, Some(vec![json!("a"), json!(0)]));
}

#[tokio::test(start_paused = true)]
async fn test_query_async_completed_without_value() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (result, ()) = tokio::join!(client.query_async(RequestOptions::body("{ a }")), async {
        conn.recv_json().await.unwrap();
        conn.send_json(&json!({"id": 0, "done": true}));
    });

    assert_eq!(result, Err(MultiplexError::Completed));
    assert_eq!(client.query_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pending_query_fails_on_disconnect_and_is_not_resent() {
    let (client, mut server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (result, ()) = tokio::join!(client.query_async(RequestOptions::body("{ a }")), async move {
        conn.recv_json().await.unwrap();
        conn.drop_connection();
    });

    assert_eq!(
        result,
        Err(MultiplexError::Disconnected(CloseInfo::abnormal("stream ended")))
    );
    assert_eq!(client.query_count(), 0);

    let mut conn = server.accept().await.unwrap();
    client.wait_open().await.unwrap();
    settle().await;
    assert_eq!(conn.try_recv(), None);
}

#[tokio::test(start_paused = true)]
async fn test_query_disconnect_handler_runs_exactly_once() {
    let (client, mut server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let results = Arc::new(AtomicUsize::new(0));
    let (tx, mut disconnects) = mpsc::unbounded_channel();
    {
        let results = Arc::clone(&results);
        client
            .query_with_disconnect(
                RequestOptions::body("{ a }"),
                move |_| {
                    results.fetch_add(1, Ordering::SeqCst);
                },
                move |info| {
                    let _ = tx.send(info.clone());
                },
            )
            .unwrap();
    }
    conn.recv_json().await.unwrap();
    conn.drop_connection();

    assert_eq!(
        disconnects.recv().await,
        Some(CloseInfo::abnormal("stream ended"))
    );

    // A second disconnect finds nothing left to notify
    server.accept().await.unwrap().drop_connection();
    let _conn = server.accept().await.unwrap();
    client.wait_open().await.unwrap();
    settle().await;

    assert_eq!(disconnects.recv().await, None);
    assert_eq!(results.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscriptions_are_replayed_after_reconnect() {
    let (client, mut server, conn) = open_client(RetryLimit::Unlimited).await;

    let (first, mut values) = client
        .subscribe_channel(
            RequestOptions::body("subscription S($n: Int) { s(n: $n) }")
                .op("S")
                .vars(vars(json!({"n": 1}))),
        )
        .unwrap();
    let second = client.subscribe(RequestOptions::name("Ticks"), |_| {}).unwrap();
    let third = client.subscribe(RequestOptions::name("Gone"), |_| {}).unwrap();
    assert!(client.unsubscribe(third));

    conn.drop_connection();
    let mut conn = server.accept().await.unwrap();

    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({
            "type": "sub",
            "query": "subscription S($n: Int) { s(n: $n) }",
            "operation": "S",
            "variables": {"n": 1},
            "id": first.0
        })
    );
    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({"type": "subId", "query": "Ticks", "id": second.0})
    );

    settle().await;
    assert_eq!(conn.try_recv(), None);
    assert_eq!(client.subscription_ids(), vec![first, second]);

    // Values after the replay reach the original handler
    conn.send_json(&json!({"id": first.0, "value": {"data": {"s": 7}}}));
    assert_eq!(values.recv().await.unwrap().data, Some(json!({"s": 7})));
}

#[tokio::test(start_paused = true)]
async fn test_subscription_disconnect_handler_runs_per_close() {
    let (client, mut server, conn) = open_client(RetryLimit::Unlimited).await;

    let (tx, mut disconnects) = mpsc::unbounded_channel();
    client
        .subscribe_with_disconnect(
            RequestOptions::name("Ticks"),
            |_| {},
            move |info| {
                let _ = tx.send(info.code);
            },
        )
        .unwrap();

    conn.drop_connection();
    assert_eq!(disconnects.recv().await, Some(1006));

    server.accept().await.unwrap().close(4001, "restart");
    assert_eq!(disconnects.recv().await, Some(4001));

    let mut conn = server.accept().await.unwrap();
    assert_eq!(conn.recv_json().await.unwrap()["query"], "Ticks");
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_done_removes_subscription_without_cancel() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (first, mut first_values) = client.subscribe_channel(RequestOptions::name("A")).unwrap();
    let (second, _second_values) = client.subscribe_channel(RequestOptions::name("B")).unwrap();
    conn.recv_json().await.unwrap();
    conn.recv_json().await.unwrap();

    conn.send_json(&json!({"id": first.0, "done": true}));
    assert!(first_values.recv().await.is_none());
    assert_eq!(client.subscription_ids(), vec![second]);
    assert!(!client.unsubscribe(first));

    // The next frame on the wire is the cancel for the other subscription
    assert!(client.unsubscribe(second));
    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({"type": "subCancel", "id": second.0})
    );
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_twice_sends_one_cancel() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (id, mut values) = client.subscribe_channel(RequestOptions::name("A")).unwrap();
    conn.recv_json().await.unwrap();

    assert!(client.unsubscribe(id));
    assert!(!client.unsubscribe(id));
    assert!(!client.unsubscribe(OperationId(42)));

    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({"type": "subCancel", "id": 0})
    );
    settle().await;
    assert_eq!(conn.try_recv(), None);

    // Late values for a cancelled id are dropped
    conn.send_json(&json!({"id": 0, "value": {"data": 1}}));
    assert!(values.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_and_malformed_messages_are_ignored() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (id, mut values) = client.subscribe_channel(RequestOptions::name("A")).unwrap();
    conn.recv_json().await.unwrap();

    conn.send_text("not json");
    conn.send_json(&json!({"value": {"data": 1}}));
    conn.send_json(&json!({"id": 99, "value": {"data": 1}}));
    conn.send_json(&json!({"id": 98, "done": true}));
    conn.send_json(&json!({"id": id.0, "value": {"data": 2}}));

    assert_eq!(values.recv().await.unwrap().data, Some(json!(2)));
    assert!(client.is_active());
    assert_eq!(client.subscription_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_clears_subscriptions_without_cancels() {
    let (client, mut server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (_, mut values) = client.subscribe_channel(RequestOptions::name("A")).unwrap();
    client.subscribe(RequestOptions::name("B"), |_| {}).unwrap();
    let (tx, mut disconnects) = mpsc::unbounded_channel();
    client
        .query_with_disconnect(RequestOptions::body("{ a }"), |_| {}, move |info| {
            let _ = tx.send(info.clone());
        })
        .unwrap();
    for _ in 0..3 {
        conn.recv_json().await.unwrap();
    }

    client.close();
    assert_eq!(client.subscription_count(), 0);
    client.wait_closed().await;
    assert!(!client.is_active());
    assert!(values.recv().await.is_none());

    assert_eq!(
        conn.recv().await,
        Some(SocketFrame::Close {
            code: 1000,
            reason: String::new()
        })
    );
    assert_eq!(
        disconnects.recv().await,
        Some(CloseInfo::new(1000, "", true))
    );

    let err = client.subscribe(RequestOptions::name("C"), |_| {}).unwrap_err();
    assert!(matches!(err, MultiplexError::Transport(_)));

    settle().await;
    assert_eq!(server.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abort_ends_subscription_streams() {
    let (client, _server, mut conn) = open_client(RetryLimit::Never).await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let (_, mut values) = client.subscribe_channel(RequestOptions::name("Ticks")).unwrap();
    {
        let disconnects = Arc::clone(&disconnects);
        client
            .subscribe_with_disconnect(
                RequestOptions::name("Other"),
                |_| {},
                move |_| {
                    disconnects.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }
    conn.recv_json().await.unwrap();
    conn.recv_json().await.unwrap();

    conn.drop_connection();

    assert!(values.recv().await.is_none());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(client.subscription_count(), 0);
    client.wait_closed().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_receiver_cancels_subscription() {
    let (client, _server, mut conn) = open_client(RetryLimit::Unlimited).await;

    let (id, values) = client.subscribe_channel(RequestOptions::name("A")).unwrap();
    let (other, _other_values) = client.subscribe_channel(RequestOptions::name("B")).unwrap();
    conn.recv_json().await.unwrap();
    conn.recv_json().await.unwrap();

    drop(values);
    conn.send_json(&json!({"id": id.0, "value": {"data": 1}}));

    assert_eq!(
        conn.recv_json().await.unwrap(),
        json!({"type": "subCancel", "id": id.0})
    );
    assert_eq!(client.subscription_ids(), vec![other]);
}

/// With no retry delay, a subscribe accepted just before the driver notices
/// the drop is sent once on the new connection, by the replay only.
#[tokio::test(start_paused = true)]
async fn test_zero_delay_reconnect_sends_each_subscription_once() {
    for _ in 0..20 {
        let (connector, mut server) = memory::pair();
        let options = TransportOptions::new("memory://graphql")
            .retry_policy(RetryPolicy::new(Duration::ZERO, RetryLimit::Unlimited));
        let client = GraphQLSocket::with_connector(options, connector);
        client.wait_open().await.unwrap();

        let mut conn = server.accept().await.unwrap();
        client.subscribe(RequestOptions::name("S"), |_| {}).unwrap();
        conn.recv_json().await.unwrap();

        conn.drop_connection();
        client.subscribe(RequestOptions::name("T"), |_| {}).unwrap();

        let mut conn = server.accept().await.unwrap();
        settle().await;

        let mut frames = Vec::new();
        while let Some(SocketFrame::Text(text)) = conn.try_recv() {
            frames.push(serde_json::from_str::<Value>(&text).unwrap());
        }
        assert_eq!(
            frames,
            vec![
                json!({"type": "subId", "query": "S", "id": 0}),
                json!({"type": "subId", "query": "T", "id": 1}),
            ]
        );
    }
}
