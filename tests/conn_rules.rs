// Connection-level rules: write admission, identity registry, timeouts,
// pending-response teardown, and metric sinks.

mod common;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use common::{start_server, start_server_with, TestClient};
use weft::{
    handler_fn, CounterMetric, Error, FrameFlags, LatencyMetric, RequestFrame,
};

const ECHO_CMD: u32 = 0x10;

#[tokio::test]
async fn write_after_self_close_is_refused() {
    let (err_tx, mut err_rx) = mpsc::channel::<String>(1);
    let handler = Arc::new(handler_fn(move |mut w, f: RequestFrame| {
        let err_tx = err_tx.clone();
        async move {
            w.start_write(f.request_id(), f.cmd(), FrameFlags::empty());
            w.write_bytes(f.payload());
            let _ = w.stream_end_write(true).await;

            let mut w2 = f.connection().writer();
            w2.start_write(f.request_id(), f.cmd(), FrameFlags::empty());
            w2.write_bytes(b"too late");
            let err = w2.end_write().await.expect_err("stream already closed");
            let _ = err_tx.send(err.to_string()).await;
        }
    }));
    let (server, addr) = start_server(handler).await;
    let mut client = TestClient::connect(addr).await;

    client.send(1, ECHO_CMD, FrameFlags::empty(), b"x").await;
    let echo = client.recv_expect().await;
    assert_eq!(echo.payload, b"x");

    let err = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("timed out")
        .expect("handler dropped");
    assert_eq!(err, Error::WriteAfterSelfClose.to_string());

    server.shutdown();
}

#[tokio::test]
async fn rst_for_unknown_stream_is_an_error() {
    let (err_tx, mut err_rx) = mpsc::channel::<String>(1);
    let handler = Arc::new(handler_fn(move |mut w, f: RequestFrame| {
        let err_tx = err_tx.clone();
        async move {
            let mut stray = f.connection().writer();
            let err = stray
                .reset_frame(0xDEAD_0000_0000_0001, 0)
                .await
                .expect_err("no such stream");
            let _ = err_tx.send(err.to_string()).await;
            let _ = w.reset_frame(f.request_id(), 0).await;
        }
    }));
    let (server, addr) = start_server(handler).await;
    let mut client = TestClient::connect(addr).await;

    client.send(1, ECHO_CMD, FrameFlags::empty(), b"").await;
    let rst = client.recv_expect().await;
    assert_eq!(rst.request_id, 1);

    let err = tokio::time::timeout(Duration::from_secs(5), err_rx.recv())
        .await
        .expect("timed out")
        .expect("handler dropped");
    assert_eq!(err, Error::RstNonexistentStream.to_string());

    server.shutdown();
}

#[tokio::test]
async fn set_id_registers_the_connection_until_it_closes() {
    let handler = Arc::new(handler_fn(move |mut w, f: RequestFrame| async move {
        f.connection().set_id("alpha");
        let _ = w.reset_frame(f.request_id(), 0).await;
    }));
    let (server, addr) = start_server(handler).await;
    let mut client = TestClient::connect(addr).await;

    client.send(1, ECHO_CMD, FrameFlags::empty(), b"").await;
    let _ = client.recv_expect().await;

    let found = server.connection(0, "alpha").expect("identity registered");
    assert_eq!(found.get_id(), "alpha");
    assert_eq!(server.connection_count(), 1);

    // Dropping the client tears the connection down and unregisters it.
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.connection(0, "alpha").is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("identity never unregistered");
    assert_eq!(server.connection_count(), 0);

    server.shutdown();
}

#[tokio::test]
async fn idle_connection_hits_the_read_timeout() {
    let (server, addr) = start_server_with(
        Arc::new(handler_fn(|_w, _f| async {})),
        |binding| {
            binding.default_read_timeout = Some(Duration::from_millis(100));
        },
    )
    .await;
    let mut client = TestClient::connect(addr).await;

    let closed = tokio::time::timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for the server to give up");
    assert!(closed.is_none(), "expected the idle connection to be closed");

    server.shutdown();
}

#[tokio::test]
async fn pending_response_mailbox_closes_with_the_connection() {
    let (done_tx, mut done_rx) = mpsc::channel::<String>(2);
    let handler = Arc::new(handler_fn(move |mut w, f: RequestFrame| {
        let done_tx = done_tx.clone();
        async move {
            let conn = f.connection().clone();
            let (_id, resp) = conn
                .request(0x20, FrameFlags::empty(), b"hello?")
                .await
                .expect("request");
            let _ = w.reset_frame(f.request_id(), 0).await;
            let mailbox_tx = done_tx.clone();
            tokio::spawn(async move {
                // The peer never answers; closing the connection must
                // close the mailbox instead of leaving us hanging.
                let outcome = match resp.recv().await {
                    None => "mailbox closed".to_string(),
                    Some(f) => format!("unexpected reply {f:?}"),
                };
                let _ = mailbox_tx.send(outcome).await;
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = conn.close().await;

            // And a request on the torn-down connection is refused.
            let refused = match conn.request(0x20, FrameFlags::empty(), b"").await {
                Err(e) => e.to_string(),
                Ok(_) => "unexpectedly accepted".to_string(),
            };
            let _ = done_tx.send(refused).await;
        }
    }));
    let (server, addr) = start_server(handler).await;
    let mut client = TestClient::connect(addr).await;

    client.send(1, ECHO_CMD, FrameFlags::empty(), b"").await;

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let outcome = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
            .await
            .expect("timed out")
            .expect("handler dropped");
        outcomes.push(outcome);
    }
    outcomes.sort();
    assert_eq!(
        outcomes,
        vec![
            Error::ConnAlreadyClosed.to_string(),
            "mailbox closed".to_string()
        ]
    );

    server.shutdown();
}

#[derive(Default)]
struct TestCounter {
    observations: Mutex<Vec<(String, String, u64)>>,
}

impl CounterMetric for TestCounter {
    fn add(&self, labels: &[(&str, &str)], delta: u64) {
        let method = labels
            .iter()
            .find(|(k, _)| *k == "method")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        let error = labels
            .iter()
            .find(|(k, _)| *k == "error")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        self.observations.lock().push((method, error, delta));
    }
}

#[derive(Default)]
struct TestLatency {
    observations: Mutex<Vec<(String, f64)>>,
}

impl LatencyMetric for TestLatency {
    fn observe(&self, labels: &[(&str, &str)], seconds: f64) {
        let method = labels
            .iter()
            .find(|(k, _)| *k == "method")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();
        self.observations.lock().push((method, seconds));
    }
}

#[tokio::test]
async fn dispatch_reports_to_the_metric_sinks() {
    let counter = Arc::new(TestCounter::default());
    let latency = Arc::new(TestLatency::default());

    let handler = Arc::new(handler_fn(|mut w, f: RequestFrame| async move {
        if f.payload().is_empty() {
            panic!("empty payload");
        }
        w.start_write(f.request_id(), f.cmd(), FrameFlags::empty());
        let _ = w.stream_end_write(true).await;
    }));
    let (server, addr) = {
        let counter = counter.clone();
        let latency = latency.clone();
        start_server_with(handler, move |binding| {
            binding.counter_metric = Some(counter);
            binding.latency_metric = Some(latency);
        })
        .await
    };
    let mut client = TestClient::connect(addr).await;

    client.send(1, ECHO_CMD, FrameFlags::empty(), b"ok").await;
    let _ = client.recv_expect().await;
    client.send(2, ECHO_CMD, FrameFlags::empty(), b"").await;
    let rst = client.recv_expect().await;
    assert_eq!(rst.flags, FrameFlags::RST);

    tokio::time::timeout(Duration::from_secs(5), async {
        while counter.observations.lock().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("metrics never arrived");

    let observations = counter.observations.lock().clone();
    let cmd_label = ECHO_CMD.to_string();
    assert_eq!(observations[0], (cmd_label.clone(), String::new(), 1));
    assert_eq!(
        observations[1],
        (cmd_label.clone(), "empty payload".to_string(), 1)
    );

    let latencies = latency.observations.lock();
    assert_eq!(latencies.len(), 2);
    assert!(latencies.iter().all(|(m, s)| *m == cmd_label && *s >= 0.0));

    server.shutdown();
}

#[tokio::test]
async fn buffered_inbound_channel_handles_a_burst() {
    let handler = Arc::new(handler_fn(|mut w, f: RequestFrame| async move {
        w.start_write(f.request_id(), f.cmd(), FrameFlags::empty());
        w.write_bytes(f.payload());
        let _ = w.stream_end_write(true).await;
    }));
    let (server, addr) = start_server_with(handler, |binding| {
        binding.read_frame_ch_size = 16;
    })
    .await;
    let mut client = TestClient::connect(addr).await;

    for i in 0..16u64 {
        client
            .send(i + 1, ECHO_CMD, FrameFlags::NON_BLOCK, &i.to_be_bytes())
            .await;
    }
    let mut seen = Vec::new();
    for _ in 0..16 {
        let frame = client.recv_expect().await;
        seen.push(frame.request_id);
    }
    seen.sort_unstable();
    assert_eq!(seen, (1..=16).collect::<Vec<_>>());

    server.shutdown();
}
