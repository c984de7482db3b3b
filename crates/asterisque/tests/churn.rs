//! Ordering and liveness under concurrent load.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;

use asterisque::prelude::*;
use asterisque::PRIORITY_NORMAL;

/// Echoes every block straight back, then reports how many it saw.
fn relay_service() -> Service {
    Service::new("relay")
        .func(1, "relay", |pipe, _params| async move {
            let mut stream = pipe
                .block_stream()
                .map_err(|e| Abort::unexpected(e.to_string()))?;
            let mut count: i64 = 0;
            while let Some(block) = stream.next().await {
                count += 1;
                pipe.send_block(block)
                    .await
                    .map_err(|e| Abort::unexpected(e.to_string()))?;
            }
            pipe.send_eof()
                .await
                .map_err(|e| Abort::unexpected(e.to_string()))?;
            Ok(Value::I64(count))
        })
        .func(2, "tag", |_pipe, params| async move {
            let n: i64 = params.get(0)?;
            Ok(Value::I64(n * 2))
        })
}

async fn connected() -> (Arc<Session>, Arc<Session>) {
    let server = Node::new("server");
    server.serve(relay_service()).unwrap();
    let client = Node::new("client");

    let (primary_wire, secondary_wire) = Wire::pair();
    let primary = server.bind(primary_wire).unwrap();
    let secondary = client.bind(secondary_wire).unwrap();
    primary.wait_active().await.unwrap();
    secondary.wait_active().await.unwrap();
    (primary, secondary)
}

/// Blocks of one pipe come back in exactly the order they were sent,
/// even with a second pipe's traffic interleaved on the same wire.
#[tokio::test]
async fn per_pipe_order_survives_interleaving() {
    let (_primary, secondary) = connected().await;

    let first = secondary.open(PRIORITY_NORMAL, 1, vec![]).unwrap();
    let second = secondary.open(PRIORITY_NORMAL, 1, vec![]).unwrap();
    let first_stream = first.block_stream().unwrap();
    let second_stream = second.block_stream().unwrap();

    for i in 0..100u16 {
        let payload = Bytes::copy_from_slice(&i.to_be_bytes());
        if i % 2 == 0 {
            first.send_block(payload).await.unwrap();
        } else {
            second.send_block(payload).await.unwrap();
        }
    }
    first.send_eof().await.unwrap();
    second.send_eof().await.unwrap();

    let firsts: Vec<u16> = first_stream
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect()
        .await;
    let seconds: Vec<u16> = second_stream
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect()
        .await;

    assert_eq!(firsts, (0..100).filter(|i| i % 2 == 0).collect::<Vec<_>>());
    assert_eq!(seconds, (0..100).filter(|i| i % 2 == 1).collect::<Vec<_>>());

    assert_eq!(first.result().await, Ok(Value::I64(50)));
    assert_eq!(second.result().await, Ok(Value::I64(50)));
}

/// Many unary calls in flight at once, all resolving with their own
/// result.
#[tokio::test]
async fn concurrent_calls_resolve_independently() {
    let (_primary, secondary) = connected().await;

    let mut handles = Vec::new();
    for n in 0..50i64 {
        let session = secondary.clone();
        handles.push(tokio::spawn(async move {
            let pipe = session
                .open(PRIORITY_NORMAL, 2, vec![Value::I64(n)])
                .unwrap();
            (n, pipe.result().await)
        }));
    }

    for handle in handles {
        let (n, result) = handle.await.unwrap();
        assert_eq!(result, Ok(Value::I64(n * 2)));
    }

    assert_eq!(secondary.pipe_count(), 0);
}

/// Streaming calls from both peers at once share the wire without
/// corrupting each other.
#[tokio::test]
async fn bidirectional_streaming() {
    let server = Node::new("server");
    server.serve(relay_service()).unwrap();
    let client = Node::new("client");
    client.serve(relay_service()).unwrap();

    let (primary_wire, secondary_wire) = Wire::pair();
    let primary = server.bind(primary_wire).unwrap();
    let secondary = client.bind(secondary_wire).unwrap();
    primary.wait_active().await.unwrap();
    secondary.wait_active().await.unwrap();

    let mut tasks = Vec::new();
    for session in [primary, secondary] {
        tasks.push(tokio::spawn(async move {
            let pipe = session.open(PRIORITY_NORMAL, 1, vec![]).unwrap();
            let stream = pipe.block_stream().unwrap();
            for i in 0..20u8 {
                pipe.send_block(Bytes::copy_from_slice(&[i])).await.unwrap();
            }
            pipe.send_eof().await.unwrap();
            let echoed: Vec<u8> = stream.map(|b| b[0]).collect().await;
            assert_eq!(echoed, (0..20).collect::<Vec<u8>>());
            pipe.result().await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), Ok(Value::I64(20)));
    }
}
