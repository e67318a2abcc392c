//! Transfer Coordinator
//!
//! Serves the replication endpoints. The master of a volume runs the
//! engine locally; any other node proxies the request to the master.

use std::collections::HashSet;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt, TryStreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::replication::{Prelude, Progress, Relay, RelayHandle, Transform, CHUNK_SIZE};
use crate::transfer::engine::{read_all, RunningProcess};
use crate::transfer::proxy;
use crate::volume::{Origin, VolumeState};

/// A byte stream whose failure surfaces as a final error item
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync + 'static>>;

/// Error body of the replication endpoints
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Status code a failed receive answers with
pub fn status_for(e: &Error) -> StatusCode {
    match e {
        Error::MalformedPrelude(_) | Error::SubprocessFailed { .. } => StatusCode::BAD_REQUEST,
        Error::NotMaster { .. }
        | Error::WrongState { .. }
        | Error::UnknownVolume(_)
        | Error::ReceiveInProgress(_)
        | Error::SnapshotNotFound { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_code(e: &Error) -> &'static str {
    match e {
        Error::MalformedPrelude(_) => "MALFORMED_PRELUDE",
        Error::SubprocessFailed { .. } | Error::Spawn { .. } => "ENGINE_FAILED",
        Error::NotMaster { .. } => "NOT_MASTER",
        Error::WrongState { .. } => "WRONG_STATE",
        Error::UnknownVolume(_) => "UNKNOWN_VOLUME",
        Error::ReceiveInProgress(_) => "RECEIVE_IN_PROGRESS",
        Error::SnapshotNotFound { .. } => "SNAPSHOT_NOT_FOUND",
        Error::PreludeApply(_) => "PRELUDE_APPLY_FAILED",
        Error::Credentials(_) => "CREDENTIALS",
        Error::ConnectionFailed { .. } | Error::Network(_) | Error::NoAddresses(_) => "PROXY_FAILED",
        _ => "INTERNAL_ERROR",
    }
}

/// JSON error response
pub fn error_response(status: StatusCode, e: &Error) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
            code: error_code(e).to_string(),
        }),
    )
        .into_response()
}

/// Volumes with a receive in flight on this node
#[derive(Clone, Default)]
pub struct ReceiveLocks {
    active: Arc<Mutex<HashSet<String>>>,
}

impl ReceiveLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the receive lock for a volume, or fail if it is held
    pub fn try_acquire(&self, filesystem: &str) -> Result<ReceiveGuard> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(filesystem.to_string()) {
            return Err(Error::ReceiveInProgress(filesystem.to_string()));
        }
        Ok(ReceiveGuard {
            filesystem: filesystem.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn is_held(&self, filesystem: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(filesystem)
    }
}

/// Releases the receive lock when dropped
pub struct ReceiveGuard {
    filesystem: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ReceiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.filesystem);
    }
}

fn replication_path(filesystem: &str, from: &str, to: &str) -> String {
    format!("/filesystems/{}/{}/{}", filesystem, from, to)
}

/// `GET /filesystems/:fs/:from/:to`
pub async fn serve_send(ctx: Arc<NodeContext>, filesystem: String, from: String, to: String) -> Response {
    if !ctx.cache.is_master(&filesystem) {
        let path = replication_path(&filesystem, &from, &to);
        return proxy::forward(&ctx, &filesystem, Method::GET, &path, None).await;
    }

    match open_send_stream(&ctx, &filesystem, &from, &to, None).await {
        Ok(stream) => (StatusCode::OK, Body::from_stream(stream)).into_response(),
        Err(e) => {
            tracing::warn!("Send of {} {}..{} failed: {}", filesystem, from, to, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

/// `POST /filesystems/:fs/:from/:to`
pub async fn serve_receive(
    ctx: Arc<NodeContext>,
    filesystem: String,
    from: String,
    to: String,
    body: Body,
) -> Response {
    if !ctx.cache.is_master(&filesystem) {
        let path = replication_path(&filesystem, &from, &to);
        return proxy::forward(&ctx, &filesystem, Method::POST, &path, Some(body)).await;
    }

    match receive_as_master(&ctx, &filesystem, &from, body).await {
        Ok(stdout) => {
            tracing::info!("Received {} {}..{}", filesystem, from, to);
            (StatusCode::OK, stdout).into_response()
        }
        Err(e) => {
            tracing::warn!("Receive of {} {}..{} failed: {}", filesystem, from, to, e);
            error_response(status_for(&e), &e)
        }
    }
}

async fn receive_as_master(ctx: &Arc<NodeContext>, filesystem: &str, from: &str, body: Body) -> Result<Vec<u8>> {
    // The local actor's latest transition, not the refreshed cache entry
    let current = ctx.volume(filesystem).current();
    if current.state != VolumeState::Receiving {
        return Err(Error::WrongState {
            filesystem: filesystem.to_string(),
            state: current.state.to_string(),
            required: VolumeState::Receiving.to_string(),
        });
    }
    let _guard = ctx.receives.try_acquire(filesystem)?;

    let (tx, mut rx) = mpsc::channel::<Progress>(ctx.config.transfer.progress_depth);
    let progress_ctx = Arc::clone(ctx);
    let topic = filesystem.to_string();
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            progress_ctx.bus.receive_progress.publish(&topic, progress.bytes);
        }
    });

    let reader = StreamReader::new(body.into_data_stream().map_err(std::io::Error::other));
    let stdout = receive_stream(ctx, filesystem, from, reader, Some(tx)).await?;

    if let Some(receive_id) = current.receive_id {
        ctx.bus.push_completed.publish(filesystem, receive_id);
    }
    Ok(stdout)
}

/// Build the compressed send stream for `from..to`: the prelude, then the
/// engine output. The stream ends in an error item if the engine or the
/// relay fails.
pub async fn open_send_stream(
    ctx: &NodeContext,
    filesystem: &str,
    from: &str,
    to: &str,
    progress: Option<mpsc::Sender<Progress>>,
) -> Result<ByteStream> {
    let lineage = ctx.metadata.snapshots(filesystem).await?;
    let prelude = Prelude::for_send(filesystem, &lineage, to)?.encode()?;

    let command = ctx.engine.send_command(filesystem, from, to);
    let mut process = ctx.runner.spawn(&command)?;
    drop(process.stdin.take());
    let stdout = process.stdout.take().ok_or_else(|| Error::Spawn {
        command: command.to_string(),
        reason: "no stdout".into(),
    })?;
    let stderr = process.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));

    tracing::debug!("Sending {} {}..{} with {}", filesystem, from, to, command);

    let source = Cursor::new(prelude).chain(stdout);
    let (sink, reader) = tokio::io::duplex(CHUNK_SIZE * 2);
    let mut relay = Relay::new(command.to_string(), "send stream", Transform::Compress);
    if let Some(progress) = progress {
        relay = relay.with_progress(progress);
    }
    let handle = relay.spawn(source, sink);

    let command = command.to_string();
    let outcome = async move {
        let relayed = handle.done().await;
        let exit = process.wait().await;
        let stderr = match stderr {
            Some(task) => task.await.ok().and_then(|r| r.ok()).unwrap_or_default(),
            None => String::new(),
        };
        match (relayed, exit) {
            (Ok(_), Ok(exit)) if exit.success() => Ok(()),
            (Ok(_), Ok(exit)) => Err(Error::SubprocessFailed {
                command,
                code: exit.code,
                stderr,
            }),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    };

    Ok(with_outcome(reader, outcome))
}

/// Stream `reader` to the end, then surface `outcome` as a trailing error.
/// The outcome is driven on its own task, so it completes even if the
/// stream is dropped early.
pub fn with_outcome<R, F>(reader: R, outcome: F) -> ByteStream
where
    R: AsyncRead + Send + Sync + 'static,
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = oneshot::channel::<std::io::Error>();
    tokio::spawn(async move {
        if let Err(e) = outcome.await {
            tracing::warn!("Stream ended with failure: {}", e);
            let _ = tx.send(std::io::Error::other(e.to_string()));
        }
    });

    let tail = futures::stream::once(rx)
        .filter_map(|failure| futures::future::ready(failure.ok().map(Err::<Bytes, _>)));
    Box::pin(ReaderStream::new(reader).chain(tail))
}

/// Stream a relay's output, failing the stream if the relay fails
pub fn relayed<R>(reader: R, handle: RelayHandle) -> ByteStream
where
    R: AsyncRead + Send + Sync + 'static,
{
    with_outcome(reader, async move { handle.done().await.map(|_| ()) })
}

/// Run the local receive pipeline over a compressed stream: decompress,
/// split off the prelude, feed the rest to the engine and, only if the
/// engine succeeds, apply the prelude. A `from` naming another volume's
/// snapshot records it as the clone origin. Returns the engine's stdout.
pub async fn receive_stream<R>(
    ctx: &NodeContext,
    filesystem: &str,
    from: &str,
    body: R,
    progress: Option<mpsc::Sender<Progress>>,
) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (sink, reader) = tokio::io::duplex(CHUNK_SIZE * 2);
    let mut relay = Relay::new("receive stream", "prelude decoder", Transform::Decompress);
    if let Some(progress) = progress {
        relay = relay.with_progress(progress);
    }
    let relay = relay.spawn(body, sink);

    let (prelude, mut rest) = Prelude::decode(reader).await?;
    tracing::debug!(
        "Receiving {} with prelude of {} snapshots",
        filesystem,
        prelude.snapshots.len()
    );

    let command = ctx.engine.receive_command(filesystem);
    let mut process = ctx.runner.spawn(&command)?;
    let (stdin, stdout, stderr) = take_pipes(&mut process, &command.to_string())?;

    let feed = async move {
        let mut stdin = stdin;
        let copied = tokio::io::copy(&mut rest, &mut stdin).await;
        let _ = stdin.shutdown().await;
        copied
    };
    let (fed, output, errors) = tokio::join!(feed, read_bytes(stdout), read_all(stderr));
    let exit = process.wait().await?;
    let relayed = relay.done().await;

    let stderr = errors.map_err(|e| Error::LocalFailure(format!("unable to read engine stderr: {}", e)))?;
    if !exit.success() {
        return Err(Error::SubprocessFailed {
            command: command.to_string(),
            code: exit.code,
            stderr,
        });
    }
    relayed?;
    fed?;
    let stdout = output?;

    let origin = Origin::parse(from).filter(|o| o.filesystem_id != filesystem);
    let applied = ctx
        .metadata
        .apply_prelude(filesystem, &prelude, origin.as_ref())
        .await
        .map_err(|e| match e {
            Error::PreludeApply(_) => e,
            other => Error::PreludeApply(other.to_string()),
        })?;
    if let Some(origin) = origin {
        tracing::info!("{} is a clone of {}", filesystem, origin);
    }
    ctx.publish_snapshots(filesystem, applied).await;

    Ok(stdout)
}

type Pipes = (
    crate::transfer::engine::ProcessInput,
    crate::transfer::engine::ProcessOutput,
    crate::transfer::engine::ProcessOutput,
);

fn take_pipes(process: &mut RunningProcess, command: &str) -> Result<Pipes> {
    let missing = |pipe: &str| Error::Spawn {
        command: command.to_string(),
        reason: format!("no {}", pipe),
    };
    let stdin = process.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = process.stdout.take().ok_or_else(|| missing("stdout"))?;
    let stderr = process.stderr.take().ok_or_else(|| missing("stderr"))?;
    Ok((stdin, stdout, stderr))
}

async fn read_bytes(mut pipe: crate::transfer::engine::ProcessOutput) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    pipe.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::compress::encode_frame;
    use crate::test_support::{compressed, test_context, test_context_with, MockRunner, SpyMetadataStore};
    use crate::transfer::START;
    use crate::volume::{Event, Snapshot};
    use std::time::Duration;

    async fn receiving(ctx: &Arc<NodeContext>, filesystem: &str) {
        let handle = ctx.volume(filesystem);
        let mut watch = handle.watch();
        watch
            .wait_for(|t| t.state != VolumeState::Discovering)
            .await
            .unwrap();
        let response = handle.submit(Event::new("prepare-for-push")).await.unwrap();
        assert_eq!(response.name, "awaiting-transfer");
    }

    fn push_body(snapshots: Vec<Snapshot>, payload: &[u8]) -> Vec<u8> {
        let mut stream = Prelude::new(snapshots).encode().unwrap();
        stream.extend_from_slice(payload);
        compressed(&stream)
    }

    async fn collect(stream: ByteStream) -> std::io::Result<Vec<u8>> {
        let chunks: Vec<Bytes> = stream.try_collect().await?;
        Ok(chunks.concat())
    }

    async fn decompress(wire: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        Relay::new("wire", "test", Transform::Decompress)
            .run(&wire[..], &mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_incremental_send_streams_prelude_then_engine_bytes() {
        let runner = MockRunner::new().with_send_payload(b"incremental s1..s2");
        let (ctx, _dir) = test_context(runner.clone()).await;
        ctx.metadata.append("v1", Snapshot::new("s1").with_meta("message", "one")).await.unwrap();
        ctx.metadata.append("v1", Snapshot::new("s2").with_meta("message", "two")).await.unwrap();

        let stream = open_send_stream(&ctx, "v1", "s1", "s2", None).await.unwrap();
        let plain = decompress(collect(stream).await.unwrap()).await;

        let (prelude, rest) = Prelude::decode(&plain[..]).await.unwrap();
        assert_eq!(prelude.snapshots.last().unwrap().metadata["message"], "two");
        assert_eq!(rest, b"incremental s1..s2");
        assert_eq!(
            runner.commands()[0].args,
            vec!["send", "-p", "-I", "pool/dmfs/v1@s1", "pool/dmfs/v1@s2"]
        );
    }

    #[tokio::test]
    async fn test_send_from_start_is_full_send() {
        let runner = MockRunner::new();
        let (ctx, _dir) = test_context(runner.clone()).await;
        ctx.metadata.append("v1", Snapshot::new("s1")).await.unwrap();

        let stream = open_send_stream(&ctx, "v1", START, "s1", None).await.unwrap();
        collect(stream).await.unwrap();
        assert_eq!(runner.commands()[0].args, vec!["send", "-p", "-R", "pool/dmfs/v1@s1"]);
    }

    #[tokio::test]
    async fn test_send_of_unknown_snapshot_fails_before_engine() {
        let runner = MockRunner::new();
        let (ctx, _dir) = test_context(runner.clone()).await;
        let err = open_send_stream(&ctx, "v1", "START", "nope", None).await.err().unwrap();
        assert!(matches!(err, Error::SnapshotNotFound { .. }));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_never_ends_cleanly() {
        let runner = MockRunner::new().with_send_exit(1);
        let (ctx, _dir) = test_context(runner).await;
        ctx.metadata.append("v1", Snapshot::new("s1")).await.unwrap();

        let stream = open_send_stream(&ctx, "v1", "START", "s1", None).await.unwrap();
        assert!(collect(stream).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_applies_prelude_after_engine_success() {
        let runner = MockRunner::new();
        let (ctx, _dir) = test_context(runner.clone()).await;
        receiving(&ctx, "v1").await;

        let snapshots = vec![Snapshot::new("s1").with_meta("message", "one")];
        let body = push_body(snapshots.clone(), b"engine payload");
        let receive_id = ctx.volume("v1").current().receive_id.unwrap();
        let mut completed = ctx.bus.push_completed.subscribe("v1");

        let response = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(runner.received(), b"engine payload");
        assert_eq!(ctx.metadata.snapshots("v1").await.unwrap(), snapshots);
        assert_eq!(completed.recv().await, Some(receive_id));
        assert!(!ctx.receives.is_held("v1"));
    }

    #[tokio::test]
    async fn test_engine_failure_skips_prelude_apply() {
        let runner = MockRunner::new().with_recv_exit(1, "cannot receive: destination has been modified");
        let spy = Arc::new(SpyMetadataStore::new());
        let (ctx, _dir) = test_context_with(runner, Arc::clone(&spy)).await;
        receiving(&ctx, "v1").await;

        let body = push_body(vec![Snapshot::new("s1")], b"bytes");
        let response = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(body)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("destination has been modified"));
        assert_eq!(spy.applies(), 0);
    }

    #[tokio::test]
    async fn test_malformed_prelude_is_bad_request() {
        let runner = MockRunner::new();
        let (ctx, _dir) = test_context(runner.clone()).await;
        receiving(&ctx, "v1").await;

        let body = compressed(b"this is not a prelude");
        let response = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(body)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn test_receive_requires_receiving_state() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        let mut watch = handle.watch();
        watch.wait_for(|t| t.state == VolumeState::Active).await.unwrap();

        let body = push_body(vec![Snapshot::new("s1")], b"bytes");
        let response = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(body)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_at_most_one_receive_per_volume() {
        let runner = MockRunner::new().with_recv_delay(Duration::from_millis(300));
        let (ctx, _dir) = test_context(runner.clone()).await;
        receiving(&ctx, "v1").await;

        let first = {
            let ctx = Arc::clone(&ctx);
            let body = push_body(vec![Snapshot::new("s1")], b"first");
            tokio::spawn(async move {
                serve_receive(ctx, "v1".into(), "START".into(), "s1".into(), Body::from(body)).await
            })
        };
        while !ctx.receives.is_held("v1") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let body = push_body(vec![Snapshot::new("s1")], b"second");
        let second = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(body)).await;
        assert_eq!(second.status(), StatusCode::NOT_FOUND);

        assert_eq!(first.await.unwrap().status(), StatusCode::OK);
        assert_eq!(runner.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_engine_stderr_is_internal_error() {
        let runner = MockRunner::new().with_broken_recv_stderr();
        let spy = Arc::new(SpyMetadataStore::new());
        let (ctx, _dir) = test_context_with(runner, Arc::clone(&spy)).await;
        receiving(&ctx, "v1").await;

        let body = push_body(vec![Snapshot::new("s1")], b"bytes");
        let response = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(body)).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(spy.applies(), 0);
    }

    #[tokio::test]
    async fn test_truncated_wire_fails_even_if_engine_succeeds() {
        let runner = MockRunner::new();
        let spy = Arc::new(SpyMetadataStore::new());
        let (ctx, _dir) = test_context_with(runner.clone(), Arc::clone(&spy)).await;
        receiving(&ctx, "v1").await;

        // A whole first frame, then a second frame cut short
        let mut wire = push_body(vec![Snapshot::new("s1")], b"first frame");
        let tail = encode_frame(b"second frame never arrives whole");
        wire.extend_from_slice(&tail[..tail.len() - 3]);

        let response = serve_receive(Arc::clone(&ctx), "v1".into(), "START".into(), "s1".into(), Body::from(wire)).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(runner.received(), b"first frame");
        assert_eq!(spy.applies(), 0);
        assert_eq!(ctx.volume("v1").current().state, VolumeState::Receiving);
    }

    #[tokio::test]
    async fn test_local_receive_does_not_signal_push_completion() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let mut completed = ctx.bus.push_completed.subscribe("v1");
        let mut published = ctx.bus.new_snapshots.subscribe("v1");

        let body = push_body(vec![Snapshot::new("s1")], b"pulled");
        receive_stream(&ctx, "v1", START, Cursor::new(body), None).await.unwrap();

        assert_eq!(published.recv().await.unwrap(), vec![Snapshot::new("s1")]);
        assert!(completed.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_receive_from_other_volume_records_origin() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;

        let body = push_body(vec![Snapshot::new("c1")], b"clone");
        receive_stream(&ctx, "clone", "parent@s3", Cursor::new(body), None).await.unwrap();
        let origin = ctx.metadata.origin("clone").await.unwrap().unwrap();
        assert_eq!(origin.to_string(), "parent@s3");

        let body = push_body(vec![Snapshot::new("s1")], b"plain");
        receive_stream(&ctx, "v1", START, Cursor::new(body), None).await.unwrap();
        assert_eq!(ctx.metadata.origin("v1").await.unwrap(), None);
    }
}
