//! Shared test fixtures: a scriptable engine, a counting metadata store and
//! a node context wired to in-memory collaborators.

use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};

use crate::cluster::selector::FirstAddress;
use crate::cluster::{MemoryStore, NoContainers};
use crate::config::DotmeshConfig;
use crate::context::{Collaborators, NodeContext};
use crate::error::{Error, Result};
use crate::replication::compress::encode_frame;
use crate::replication::{Prelude, CHUNK_SIZE};
use crate::secrets::StaticSecretStore;
use crate::transfer::engine::{ProcessExit, ProcessInput, ProcessOutput, RunningProcess};
use crate::transfer::{Direction, EngineCommand, ProcessRunner, TransferRequest};
use crate::volume::{JsonMetadataStore, MetadataStore, Origin, Snapshot};

/// Engine stand-in. Work starts as soon as a process is spawned.
#[derive(Clone)]
pub struct MockRunner {
    send_payload: Vec<u8>,
    send_exit: i32,
    recv_exit: i32,
    recv_stderr: String,
    recv_stderr_broken: bool,
    recv_delay: Duration,
    snapshot_failure: Option<String>,
    commands: Arc<Mutex<Vec<EngineCommand>>>,
    received: Arc<Mutex<Vec<u8>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            send_payload: b"snapshot stream".to_vec(),
            send_exit: 0,
            recv_exit: 0,
            recv_stderr: String::new(),
            recv_stderr_broken: false,
            recv_delay: Duration::ZERO,
            snapshot_failure: None,
            commands: Arc::default(),
            received: Arc::default(),
            in_flight: Arc::default(),
            max_in_flight: Arc::default(),
        }
    }

    pub fn with_send_payload(mut self, payload: &[u8]) -> Self {
        self.send_payload = payload.to_vec();
        self
    }

    pub fn with_send_exit(mut self, code: i32) -> Self {
        self.send_exit = code;
        self
    }

    pub fn with_recv_exit(mut self, code: i32, stderr: &str) -> Self {
        self.recv_exit = code;
        self.recv_stderr = stderr.to_string();
        self
    }

    /// `recv` exits 0 but its stderr pipe cannot be read
    pub fn with_broken_recv_stderr(mut self) -> Self {
        self.recv_stderr_broken = true;
        self
    }

    pub fn with_recv_delay(mut self, delay: Duration) -> Self {
        self.recv_delay = delay;
        self
    }

    pub fn fail_snapshots(mut self, stderr: &str) -> Self {
        self.snapshot_failure = Some(stderr.to_string());
        self
    }

    pub fn commands(&self) -> Vec<EngineCommand> {
        self.commands.lock().unwrap().clone()
    }

    /// Everything fed to `recv` so far
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn exited(code: i32) -> ProcessExit {
        ProcessExit { code: Some(code) }
    }

    fn spawn_send(&self) -> RunningProcess {
        let (mut writer, reader) = tokio::io::duplex(CHUNK_SIZE);
        let payload = self.send_payload.clone();
        let task = tokio::spawn(async move {
            let _ = writer.write_all(&payload).await;
            let _ = writer.shutdown().await;
        });
        let code = self.send_exit;
        let stderr = if code == 0 { String::new() } else { "send failed".to_string() };
        let exit = async move {
            task.await.map_err(|e| Error::Internal(e.to_string()))?;
            Ok::<_, Error>(Self::exited(code))
        }
        .boxed();

        RunningProcess::new(
            Some(Box::new(tokio::io::sink()) as ProcessInput),
            Some(Box::new(reader) as ProcessOutput),
            Some(Box::new(Cursor::new(stderr.into_bytes())) as ProcessOutput),
            exit,
        )
    }

    fn spawn_recv(&self) -> RunningProcess {
        let (writer, mut reader) = tokio::io::duplex(CHUNK_SIZE);
        let received = Arc::clone(&self.received);
        let in_flight = Arc::clone(&self.in_flight);
        let max_in_flight = Arc::clone(&self.max_in_flight);
        let delay = self.recv_delay;

        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        max_in_flight.fetch_max(now, Ordering::SeqCst);
        let task = tokio::spawn(async move {
            let mut bytes = Vec::new();
            let _ = reader.read_to_end(&mut bytes).await;
            tokio::time::sleep(delay).await;
            received.lock().unwrap().extend_from_slice(&bytes);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
        let code = self.recv_exit;
        let exit = async move {
            task.await.map_err(|e| Error::Internal(e.to_string()))?;
            Ok::<_, Error>(Self::exited(code))
        }
        .boxed();

        let stderr: ProcessOutput = if self.recv_stderr_broken {
            Box::new(BrokenPipe)
        } else {
            Box::new(Cursor::new(self.recv_stderr.clone().into_bytes()))
        };
        RunningProcess::new(
            Some(Box::new(writer) as ProcessInput),
            Some(Box::new(tokio::io::empty()) as ProcessOutput),
            Some(stderr),
            exit,
        )
    }

    fn spawn_simple(&self, code: i32, stderr: String) -> RunningProcess {
        RunningProcess::new(
            Some(Box::new(tokio::io::sink()) as ProcessInput),
            Some(Box::new(tokio::io::empty()) as ProcessOutput),
            Some(Box::new(Cursor::new(stderr.into_bytes())) as ProcessOutput),
            async move { Ok::<_, Error>(Self::exited(code)) }.boxed(),
        )
    }
}

impl ProcessRunner for MockRunner {
    fn spawn(&self, command: &EngineCommand) -> Result<RunningProcess> {
        self.commands.lock().unwrap().push(command.clone());
        Ok(match command.verb() {
            "send" => self.spawn_send(),
            "recv" => self.spawn_recv(),
            "snapshot" => match &self.snapshot_failure {
                Some(stderr) => self.spawn_simple(1, stderr.clone()),
                None => self.spawn_simple(0, String::new()),
            },
            _ => self.spawn_simple(0, String::new()),
        })
    }
}

/// A pipe whose every read fails
struct BrokenPipe;

impl AsyncRead for BrokenPipe {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stderr pipe closed")))
    }
}

/// Metadata store that counts prelude applications
pub struct SpyMetadataStore {
    inner: JsonMetadataStore,
    applies: AtomicUsize,
    _dir: TempDir,
}

impl SpyMetadataStore {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            inner: JsonMetadataStore::open(dir.path()).unwrap(),
            applies: AtomicUsize::new(0),
            _dir: dir,
        }
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for SpyMetadataStore {
    async fn snapshots(&self, filesystem: &str) -> Result<Vec<Snapshot>> {
        self.inner.snapshots(filesystem).await
    }

    async fn append(&self, filesystem: &str, snapshot: Snapshot) -> Result<()> {
        self.inner.append(filesystem, snapshot).await
    }

    async fn apply_prelude(
        &self,
        filesystem: &str,
        prelude: &Prelude,
        origin: Option<&Origin>,
    ) -> Result<Vec<Snapshot>> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.inner.apply_prelude(filesystem, prelude, origin).await
    }

    async fn origin(&self, filesystem: &str) -> Result<Option<Origin>> {
        self.inner.origin(filesystem).await
    }
}

/// Frame `plain` the way a sender's relay would
pub fn compressed(plain: &[u8]) -> Vec<u8> {
    plain.chunks(CHUNK_SIZE).flat_map(encode_frame).collect()
}

/// Node `node-1` with a fresh data directory
pub async fn test_context(runner: MockRunner) -> (Arc<NodeContext>, TempDir) {
    let dir = TempDir::new().unwrap();
    let metadata = Arc::new(JsonMetadataStore::open(dir.path().join("metadata")).unwrap());
    let ctx = build_context("node-1", &dir, runner, metadata);
    (ctx, dir)
}

/// Like `test_context`, with a caller-supplied metadata store
pub async fn test_context_with(runner: MockRunner, metadata: Arc<SpyMetadataStore>) -> (Arc<NodeContext>, TempDir) {
    let dir = TempDir::new().unwrap();
    let ctx = build_context("node-1", &dir, runner, metadata);
    (ctx, dir)
}

/// A named node with its own data directory
pub fn node_context(node_id: &str, dir: &TempDir, runner: MockRunner) -> Arc<NodeContext> {
    let metadata = Arc::new(JsonMetadataStore::open(dir.path().join("metadata")).unwrap());
    build_context(node_id, dir, runner, metadata)
}

fn build_context(
    node_id: &str,
    dir: &TempDir,
    runner: MockRunner,
    metadata: Arc<dyn MetadataStore>,
) -> Arc<NodeContext> {
    let config = DotmeshConfig::for_node(node_id, dir.path().to_path_buf());
    let collaborators = Collaborators {
        store: Arc::new(MemoryStore::new()),
        runner: Arc::new(runner),
        metadata,
        secrets: Arc::new(StaticSecretStore::new().with("admin", "admin-key")),
        containers: Arc::new(NoContainers),
        selector: Box::new(FirstAddress),
    };
    NodeContext::new(config, collaborators).unwrap()
}

pub fn transfer_request(direction: Direction) -> TransferRequest {
    TransferRequest {
        peer: "127.0.0.1".into(),
        user: "admin".into(),
        api_key: "admin-key".into(),
        direction,
        local_namespace: "admin".into(),
        local_name: "v1".into(),
        local_branch: String::new(),
        remote_namespace: "admin".into(),
        remote_name: "v1".into(),
        remote_branch: String::new(),
        target_commit: None,
    }
}
