//! Full-stack scenarios over real TCP sockets.
//!
//! Each test binds a broker on an ephemeral port and drives it with real
//! protocol traffic. The simple happy paths use the actual node and client
//! runtimes; the failure and backpressure scenarios use hand-rolled
//! protocol-level peers so the test controls exactly when a connection
//! misbehaves or dies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use taskmill::broker::state::BrokerState;
use taskmill::protocol::wire::Connection;
use taskmill::protocol::{Command, Packet, Response, HANDSHAKE_MAGIC};
use taskmill::{Broker, Config, Job};

/// Processor used by the real-runtime tests: strips newlines from the input.
/// Pure POSIX sh + tr, so it runs anywhere the tests run.
const STRIP_NEWLINES_SRC: &[u8] = b"tr -d '\\n' < in.txt > out.txt\n";

// ─── Harness ───────────────────────────────────────────────────────────────

struct TestBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    shutdown: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_broker() -> TestBroker {
    let dir = tempfile::TempDir::new().unwrap();
    let config = Config {
        port: 0,
        ..Config::rooted_at(dir.path())
    };
    let shutdown = CancellationToken::new();
    let broker = Broker::bind(&config, shutdown.clone()).await.unwrap();
    // The broker binds the wildcard address; peers dial loopback.
    let addr = SocketAddr::from(([127, 0, 0, 1], broker.local_addr().port()));
    let state = broker.state();
    tokio::spawn(broker.run());
    TestBroker {
        addr,
        state,
        shutdown,
        _dir: dir,
    }
}

/// Node/client config rooted in its own scratch dir, using `sh` to run
/// source processors.
fn peer_config(dir: &tempfile::TempDir) -> Config {
    let mut config = Config::rooted_at(dir.path());
    config.interpreter = "sh".to_string();
    config
}

/// Poll `probe` until it returns true or `timeout` passes.
async fn wait_until<F: FnMut() -> bool>(mut probe: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─── Protocol-level peers ──────────────────────────────────────────────────

/// A client that speaks the wire protocol directly, one exchange per call.
struct RawClient {
    conn: Connection,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let mut conn = Connection::connect(addr).await.unwrap();
        conn.open_as(Response::Client).await.unwrap();
        Self { conn }
    }

    async fn upload(&mut self, source: &[u8], algorithm: Option<Uuid>) {
        self.conn.send_data(source).await.unwrap();
        if let Some(algorithm) = algorithm {
            self.conn
                .send_response(Response::SendAlgorithmId)
                .await
                .unwrap();
            self.conn.send_data(algorithm.as_bytes()).await.unwrap();
        }
        self.conn.send_response(Response::Done).await.unwrap();
    }

    /// Submit one input; `None` means the broker answered `NOTENOUGHSPACE`.
    async fn submit(&mut self, input: &[u8]) -> Option<Uuid> {
        self.conn
            .send_command(Command::SubmitSubtask)
            .await
            .unwrap();
        match self.conn.expect_response().await.unwrap() {
            Response::Ok => {
                self.conn.send_data(input).await.unwrap();
                let id = self.conn.expect_data().await.unwrap();
                Some(Uuid::from_slice(&id).unwrap())
            }
            Response::NotEnoughSpace => None,
            other => panic!("unexpected submit response {other:?}"),
        }
    }

    /// Poll one result; `None` means `NONEWRESULTS`.
    async fn poll(&mut self) -> Option<(Uuid, Vec<u8>)> {
        self.conn
            .send_command(Command::IsSubtaskDone)
            .await
            .unwrap();
        match self.conn.expect_response().await.unwrap() {
            Response::Ok => {
                let id = self.conn.expect_data().await.unwrap();
                let output = self.conn.expect_data().await.unwrap();
                Some((Uuid::from_slice(&id).unwrap(), output))
            }
            Response::NoNewResults => None,
            other => panic!("unexpected poll response {other:?}"),
        }
    }

    /// Poll until `count` results arrived or ten seconds pass.
    async fn collect(&mut self, count: usize) -> HashMap<Uuid, Vec<u8>> {
        let mut results = HashMap::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while results.len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out with {}/{count} results",
                results.len()
            );
            match self.poll().await {
                Some((id, output)) => {
                    results.insert(id, output);
                }
                None => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        results
    }
}

/// A node that speaks the wire protocol directly.
struct RawNode {
    conn: Connection,
}

impl RawNode {
    async fn connect(addr: SocketAddr) -> Self {
        let mut conn = Connection::connect(addr).await.unwrap();
        conn.open_as(Response::Node).await.unwrap();
        Self { conn }
    }

    /// One GETTASK exchange. `cached` selects the has-file reply; the
    /// downloaded source (if any) is returned alongside the assignment.
    async fn get_task(&mut self, cached: bool) -> Option<(Uuid, Option<Uuid>, Option<Vec<u8>>)> {
        self.conn.send_command(Command::GetTask).await.unwrap();
        match self.conn.expect_response().await.unwrap() {
            Response::NoNewTasks => return None,
            Response::Ok => {}
            other => panic!("unexpected GETTASK response {other:?}"),
        }
        let task = Uuid::from_slice(&self.conn.expect_data().await.unwrap()).unwrap();
        let algorithm = match self.conn.expect_response().await.unwrap() {
            Response::SendAlgorithmId => {
                Some(Uuid::from_slice(&self.conn.expect_data().await.unwrap()).unwrap())
            }
            Response::NoAlgorithmId => None,
            other => panic!("unexpected algorithm response {other:?}"),
        };

        let source = if cached {
            self.conn.send_response(Response::Ok).await.unwrap();
            None
        } else {
            self.conn
                .send_response(Response::DoesNotHaveFile)
                .await
                .unwrap();
            Some(self.conn.expect_data().await.unwrap())
        };
        Some((task, algorithm, source))
    }

    /// One GETSUBTASK exchange; `None` means the queue is drained.
    async fn get_subtask(&mut self, task: Uuid) -> Option<(Uuid, Vec<u8>)> {
        self.conn.send_command(Command::GetSubtask).await.unwrap();
        self.conn.send_data(task.as_bytes()).await.unwrap();
        match self.conn.expect_response().await.unwrap() {
            Response::NoNewSubtasks => None,
            Response::Ok => {
                let id = Uuid::from_slice(&self.conn.expect_data().await.unwrap()).unwrap();
                let input = self.conn.expect_data().await.unwrap();
                Some((id, input))
            }
            other => panic!("unexpected GETSUBTASK response {other:?}"),
        }
    }

    async fn submit_output(&mut self, subtask: Uuid, output: &[u8]) {
        self.conn
            .send_command(Command::SubmitSubtaskOutput)
            .await
            .unwrap();
        self.conn.send_data(subtask.as_bytes()).await.unwrap();
        self.conn.send_data(output).await.unwrap();
    }
}

// ─── Scenario 1: single client, single node, three subtasks ────────────────

#[tokio::test(flavor = "multi_thread")]
async fn single_client_single_node_runs_to_completion() {
    let broker = start_broker().await;

    let node_dir = tempfile::TempDir::new().unwrap();
    let node_shutdown = CancellationToken::new();
    let node_task = tokio::spawn(taskmill::node::run(
        broker.addr,
        peer_config(&node_dir),
        node_shutdown.clone(),
    ));

    let client_dir = tempfile::TempDir::new().unwrap();
    let client_config = peer_config(&client_dir);
    let processor = client_dir.path().join("processor.src");
    std::fs::write(&processor, STRIP_NEWLINES_SRC).unwrap();

    let job = Job {
        processor,
        algorithm: None,
        inputs: vec!["1\n2".into(), "3\n4".into(), "5\n6".into()],
    };
    let results = tokio::time::timeout(
        Duration::from_secs(60),
        taskmill::run_job(broker.addr, &client_config, job, CancellationToken::new()),
    )
    .await
    .expect("job timed out")
    .expect("job failed");

    let expected: HashMap<String, String> = [
        ("1\n2".to_string(), "12".to_string()),
        ("3\n4".to_string(), "34".to_string()),
        ("5\n6".to_string(), "56".to_string()),
    ]
    .into();
    assert_eq!(results, expected);

    // The session sent EXIT, so its state is torn down shortly after.
    let state = Arc::clone(&broker.state);
    assert!(
        wait_until(|| state.client_count() == 0, Duration::from_secs(5)).await,
        "client session should be cleaned up after exit"
    );
    assert_eq!(broker.state.snapshot().total_in_flight(), 0);

    // The results file landed next to the checkpoints.
    let written = std::fs::read_to_string(
        client_config.client_files_dir().join("clientOutput.txt"),
    )
    .unwrap();
    let parsed: HashMap<String, String> = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed, expected);

    node_shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), node_task).await;
}

// ─── Scenario 2: two clients share one node ────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn two_clients_one_node_all_results_reach_their_owners() {
    let broker = start_broker().await;

    let node_dir = tempfile::TempDir::new().unwrap();
    let node_shutdown = CancellationToken::new();
    let node_task = tokio::spawn(taskmill::node::run(
        broker.addr,
        peer_config(&node_dir),
        node_shutdown.clone(),
    ));

    let mut jobs = tokio::task::JoinSet::new();
    for prefix in ["a", "b"] {
        let addr = broker.addr;
        let dir = tempfile::TempDir::new().unwrap();
        let config = peer_config(&dir);
        let processor = dir.path().join("processor.src");
        std::fs::write(&processor, STRIP_NEWLINES_SRC).unwrap();
        let inputs: Vec<String> = (0..5).map(|i| format!("{prefix}\n{i}")).collect();
        let job = Job {
            processor,
            algorithm: None,
            inputs,
        };
        jobs.spawn(async move {
            let results =
                taskmill::run_job(addr, &config, job, CancellationToken::new()).await?;
            drop(dir);
            anyhow::Ok((prefix, results))
        });
    }

    let mut seen = 0;
    while let Some(joined) = tokio::time::timeout(Duration::from_secs(120), jobs.join_next())
        .await
        .expect("jobs timed out")
    {
        let (prefix, results) = joined.unwrap().unwrap();
        let expected: HashMap<String, String> = (0..5)
            .map(|i| (format!("{prefix}\n{i}"), format!("{prefix}{i}")))
            .collect();
        assert_eq!(results, expected, "results for client {prefix}");
        seen += 1;
    }
    assert_eq!(seen, 2);

    node_shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), node_task).await;
}

// ─── Scenario 3: queue-full backpressure ───────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn queue_full_backpressure_and_recovery() {
    let broker = start_broker().await;

    let mut client = RawClient::connect(broker.addr).await;
    client.upload(b"unused", None).await;

    // Lengths 0..=10 pass the strict bound check, so eleven submissions
    // land and the twelfth is refused.
    let mut accepted = Vec::new();
    for i in 0..12 {
        match client.submit(format!("input-{i}").as_bytes()).await {
            Some(id) => accepted.push(id),
            None => {
                assert_eq!(i, 11, "refusal must come on the twelfth submission");
            }
        }
    }
    assert_eq!(accepted.len(), 11);

    // A node draining one subtask makes room again.
    let mut node = RawNode::connect(broker.addr).await;
    let (task, _, source) = node.get_task(false).await.expect("work is pending");
    assert_eq!(source.as_deref(), Some(&b"unused"[..]));
    let (subtask, input) = node.get_subtask(task).await.expect("queue is non-empty");
    assert_eq!(input, b"input-0");
    node.submit_output(subtask, b"done").await;

    let resubmitted = client.submit(b"input-12").await;
    assert!(resubmitted.is_some(), "drained queue must accept again");
}

// ─── Scenario 4: node failure mid-execution ────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn node_failure_mid_execution_loses_no_work() {
    let broker = start_broker().await;

    let mut client = RawClient::connect(broker.addr).await;
    client.upload(b"processor", None).await;

    let mut submitted = Vec::new();
    for input in ["one", "two", "three"] {
        submitted.push(client.submit(input.as_bytes()).await.unwrap());
    }

    // Node A checks out two subtasks and dies without returning anything.
    let mut node_a = RawNode::connect(broker.addr).await;
    let (task, _, _) = node_a.get_task(false).await.unwrap();
    let first = node_a.get_subtask(task).await.unwrap();
    let second = node_a.get_subtask(task).await.unwrap();
    assert_ne!(first.0, second.0);
    drop(node_a);

    // Reclamation: the two in-flight subtasks return to pending.
    let state = Arc::clone(&broker.state);
    assert!(
        wait_until(
            || {
                let snapshot = state.snapshot();
                snapshot.clients.first().is_some_and(|c| c.queued == 3)
                    && snapshot.total_in_flight() == 0
            },
            Duration::from_secs(5),
        )
        .await,
        "in-flight subtasks were not reclaimed"
    );

    // Node B finishes everything.
    let mut node_b = RawNode::connect(broker.addr).await;
    let (task_b, _, _) = node_b.get_task(false).await.unwrap();
    assert_eq!(task_b, task);
    let mut executed = 0;
    while let Some((subtask, input)) = node_b.get_subtask(task_b).await {
        let output = format!("done-{}", String::from_utf8_lossy(&input));
        node_b.submit_output(subtask, output.as_bytes()).await;
        executed += 1;
    }
    assert_eq!(executed, 3, "node B must run all three subtasks");

    // Five checkouts happened in total: two lost on A plus three on B.
    let results = client.collect(3).await;
    let returned: std::collections::HashSet<Uuid> = results.keys().copied().collect();
    let expected: std::collections::HashSet<Uuid> = submitted.into_iter().collect();
    assert_eq!(returned, expected, "every accepted subtask id must come back");
}

// ─── Scenario 5: cached binary skips the download ──────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn cached_binary_path_skips_source_transfer() {
    let broker = start_broker().await;
    let algorithm = Uuid::new_v4();

    // Seed the node's cache with an executable for this algorithm id before
    // the node ever sees the task.
    let node_dir = tempfile::TempDir::new().unwrap();
    let node_config = peer_config(&node_dir);
    let cache_dir = node_config.node_files_dir();
    std::fs::create_dir_all(&cache_dir).unwrap();
    let binary = cache_dir.join(algorithm.to_string());
    std::fs::write(
        &binary,
        "#!/bin/sh\nprintf 'binary:' > out.txt\ntr -d '\\n' < in.txt >> out.txt\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&binary, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let node_shutdown = CancellationToken::new();
    let node_task = tokio::spawn(taskmill::node::run(
        broker.addr,
        node_config,
        node_shutdown.clone(),
    ));

    // The uploaded source would produce a different prefix; if the node ran
    // it, the assertion below would catch it.
    let client_dir = tempfile::TempDir::new().unwrap();
    let client_config = peer_config(&client_dir);
    let processor = client_dir.path().join("processor.src");
    std::fs::write(&processor, b"printf 'source:' > out.txt\n").unwrap();

    let job = Job {
        processor,
        algorithm: Some(algorithm),
        inputs: vec!["7\n8".into()],
    };
    let results = tokio::time::timeout(
        Duration::from_secs(60),
        taskmill::run_job(broker.addr, &client_config, job, CancellationToken::new()),
    )
    .await
    .expect("job timed out")
    .expect("job failed");

    assert_eq!(results.get("7\n8").map(String::as_str), Some("binary:78"));

    node_shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(10), node_task).await;
}

// ─── Scenario 6: handshake rejection ───────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn bad_handshake_leaves_no_trace() {
    let broker = start_broker().await;

    let mut conn = Connection::connect(broker.addr).await.unwrap();
    conn.send(&Packet::Handshake(vec![0, 0, 0])).await.unwrap();
    let err = conn.recv().await.unwrap_err();
    assert!(!err.is_violation(), "peer sees a plain close, got {err:?}");

    assert_eq!(broker.state.client_count(), 0);
    assert_eq!(broker.state.node_count(), 0);

    // The broker is still healthy for the next, well-behaved peer.
    let mut ok = Connection::connect(broker.addr).await.unwrap();
    ok.send(&Packet::Handshake(HANDSHAKE_MAGIC.to_vec()))
        .await
        .unwrap();
    assert_eq!(ok.expect_response().await.unwrap(), Response::Ok);
}
