use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::watch,
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;

use staged::{
    intent::{DeployMode, IntentPolicy},
    queue::CoalescingQueue,
    stream::{ConsumerState, StreamConsumer, StreamSettings},
};

fn policy(mode: DeployMode) -> IntentPolicy {
    IntentPolicy {
        mode,
        trusted_source_prefix: "https://gitbox.apache.org/repos/asf/".to_string(),
        org_domain: "apache.org".to_string(),
        protected_targets: vec!["www.apache.org".to_string()],
        default_branch: "asf-site".to_string(),
        default_pusher: "root".to_string(),
    }
}

fn settings(url: String, reconnect_backoff: Duration) -> StreamSettings {
    StreamSettings {
        url,
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(2),
        reconnect_backoff,
    }
}

/// Serves `chunks` to every connection with a pause between writes, then
/// closes. Returns the url and a counter of accepted connections.
async fn serve(status_line: &'static str, chunks: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener address");
    let connections = Arc::new(AtomicUsize::new(0));
    let accepted = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let chunks = chunks.clone();
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0_u8; 512];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(read) => request.extend_from_slice(&buf[..read]),
                    }
                }

                let head = format!(
                    "{status_line}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n"
                );
                if socket.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                for chunk in chunks {
                    if socket.write_all(chunk.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = socket.flush().await;
                    sleep(Duration::from_millis(10)).await;
                }
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{addr}/"), connections)
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should hold before the deadline");
}

async fn wait_for_state(states: &mut watch::Receiver<ConsumerState>, wanted: ConsumerState) {
    timeout(Duration::from_secs(10), states.wait_for(|state| *state == wanted))
        .await
        .expect("state should be reached before the deadline")
        .expect("consumer should still be alive");
}

#[tokio::test]
async fn consumes_records_skips_bad_ones_and_reconnects_after_close() {
    let (url, connections) = serve(
        "HTTP/1.1 200 OK",
        vec![
            "{\"staging\": {\"project\": \"foo\", \"source\": \"https://gitbox.apache.org/repos/asf/foo.git\", \"branch\": \"main\"}},\n",
            "this is not json\n\0\n",
            "{\"commit\": {\"repository\": \"unrelated\"}}\n{\"staging\": {\"proj",
            "ect\": \"bar\", \"source\": \"https://gitbox.apache.org/repos/asf/bar.git\"}}\n",
            "{\"staging\": {\"project\": \"..\", \"source\": \"https://gitbox.apache.org/repos/asf/x.git\"}}\n",
        ],
    )
    .await;

    let queue = CoalescingQueue::new();
    let consumer = StreamConsumer::new(
        settings(url, Duration::from_secs(60)),
        policy(DeployMode::Staging),
        queue.clone(),
    )
    .expect("consumer should build");
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(consumer.run(shutdown.clone()));

    // Reconnecting after the server closes must not wait out the backoff.
    wait_for(|| queue.len() == 2 && connections.load(Ordering::SeqCst) >= 2).await;

    shutdown.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer should stop after cancellation")
        .expect("consumer task should not panic");

    let drained = queue.drain_all();
    assert_eq!(
        drained.keys().cloned().collect::<Vec<_>>(),
        vec!["bar".to_string(), "foo".to_string()]
    );
    assert_eq!(drained["foo"].branch(), "main");
    assert_eq!(drained["bar"].branch(), "asf-site");
    assert_eq!(drained["bar"].committer(), "root");
}

#[tokio::test]
async fn publish_mode_ignores_staging_records() {
    let (url, connections) = serve(
        "HTTP/1.1 200 OK",
        vec![
            "{\"staging\": {\"project\": \"foo\", \"source\": \"https://gitbox.apache.org/repos/asf/foo.git\"}}\n",
            "{\"publish\": {\"project\": \"foo\", \"source\": \"https://gitbox.apache.org/repos/asf/foo.git\", \"target\": \"\"}}\n",
        ],
    )
    .await;

    let queue = CoalescingQueue::new();
    let consumer = StreamConsumer::new(
        settings(url, Duration::from_secs(60)),
        policy(DeployMode::Publish),
        queue.clone(),
    )
    .expect("consumer should build");
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(consumer.run(shutdown.clone()));

    wait_for(|| !queue.is_empty() && connections.load(Ordering::SeqCst) >= 1).await;
    shutdown.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer should stop after cancellation")
        .expect("consumer task should not panic");

    let drained = queue.drain_all();
    assert_eq!(
        drained.keys().cloned().collect::<Vec<_>>(),
        vec!["foo.apache.org".to_string()]
    );
}

#[tokio::test]
async fn unreachable_stream_backs_off_and_stays_cancellable() {
    let unused = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let url = format!("http://{}/", unused.local_addr().expect("listener address"));
    drop(unused);

    let consumer = StreamConsumer::new(
        settings(url, Duration::from_secs(3600)),
        policy(DeployMode::Staging),
        CoalescingQueue::new(),
    )
    .expect("consumer should build");
    let states = consumer.subscribe_state();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(consumer.run(shutdown.clone()));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(*states.borrow(), ConsumerState::Disconnected);

    shutdown.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("backoff sleep should observe cancellation")
        .expect("consumer task should not panic");
}

#[tokio::test]
async fn error_status_counts_as_failed_connect() {
    let (url, connections) = serve("HTTP/1.1 503 Service Unavailable", vec![]).await;

    let consumer = StreamConsumer::new(
        settings(url, Duration::from_secs(3600)),
        policy(DeployMode::Staging),
        CoalescingQueue::new(),
    )
    .expect("consumer should build");
    let mut states = consumer.subscribe_state();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(consumer.run(shutdown.clone()));

    wait_for(|| connections.load(Ordering::SeqCst) >= 1).await;
    wait_for_state(&mut states, ConsumerState::Disconnected).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    shutdown.cancel();
    timeout(Duration::from_secs(5), task)
        .await
        .expect("consumer should stop after cancellation")
        .expect("consumer task should not panic");
}
