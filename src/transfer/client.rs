//! Transfer Client
//!
//! Drives a push to, or pull from, a peer on behalf of a volume actor.

use std::future::Future;
use std::sync::Arc;

use futures::stream::TryStreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use uuid::Uuid;

use crate::cluster::selector::peer_url;
use crate::config::RetryPolicy;
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::replication::Progress;
use crate::transfer::coordinator::{open_send_stream, receive_stream};
use crate::transfer::{Direction, TransferRequest, START};
use crate::volume::{Event, Snapshot};

/// What a transfer has to move
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// The destination already holds the target
    UpToDate,
    /// Send `from..to`; `from` is `START` for a full send
    Send { from: String, to: String },
}

/// Work out what to send from `source` so that `destination` holds
/// `target` (the newest source snapshot by default). The destination must
/// be a prefix of the source lineage.
pub fn plan_transfer(
    filesystem: &str,
    source: &[Snapshot],
    destination: &[Snapshot],
    target: Option<&str>,
) -> Result<Plan> {
    let to = match target {
        Some(target) => target.to_string(),
        None => source
            .last()
            .map(|s| s.id.clone())
            .ok_or_else(|| Error::Transfer(format!("{} has no snapshots to transfer", filesystem)))?,
    };
    let to_index = source
        .iter()
        .position(|s| s.id == to)
        .ok_or_else(|| Error::SnapshotNotFound {
            filesystem: filesystem.to_string(),
            snapshot: to.clone(),
        })?;

    for (i, snapshot) in destination.iter().enumerate() {
        if source.get(i).map(|s| s.id.as_str()) != Some(snapshot.id.as_str()) {
            return Err(Error::Transfer(format!(
                "{} has diverged: destination holds {} where the source does not",
                filesystem, snapshot.id
            )));
        }
    }

    if destination.len() > to_index {
        return Ok(Plan::UpToDate);
    }
    let from = destination
        .last()
        .map(|s| s.id.clone())
        .unwrap_or_else(|| START.to_string());
    Ok(Plan::Send { from, to })
}

/// Run a transfer to completion, returning a summary for the poll result
pub async fn run_transfer(
    ctx: &Arc<NodeContext>,
    filesystem: &str,
    id: Uuid,
    request: &TransferRequest,
) -> Result<String> {
    let peer = Peer::new(ctx, request);
    match peer.node_id().await {
        Ok(node) => ctx.transfers.identify_peer(&id, &node),
        Err(e) => tracing::debug!("Could not identify {}: {}", request.peer, e),
    }
    match request.direction {
        Direction::Push => push(ctx, &peer, filesystem, id, request).await,
        Direction::Pull => pull(ctx, &peer, filesystem, id, request).await,
    }
}

async fn push(
    ctx: &Arc<NodeContext>,
    peer: &Peer<'_>,
    filesystem: &str,
    id: Uuid,
    request: &TransferRequest,
) -> Result<String> {
    let policy = ctx.config.transfer.retry;

    peer.create(filesystem).await?;
    with_retry(policy, "prepare-for-push", || async {
        let answer = peer.submit(filesystem, Event::new("prepare-for-push")).await?;
        if answer.name != "awaiting-transfer" {
            return Err(Error::WrongState {
                filesystem: filesystem.to_string(),
                state: answer.str_arg("state").unwrap_or(&answer.name).to_string(),
                required: "active".into(),
            });
        }
        Ok(())
    })
    .await?;

    let pushed = push_prepared(ctx, peer, filesystem, id, request).await;
    if pushed.is_err() {
        if let Err(e) = peer.submit(filesystem, Event::new("abort-push")).await {
            tracing::warn!("Failed to abort push of {} on {}: {}", filesystem, request.peer, e);
        }
    }
    pushed
}

async fn push_prepared(
    ctx: &Arc<NodeContext>,
    peer: &Peer<'_>,
    filesystem: &str,
    id: Uuid,
    request: &TransferRequest,
) -> Result<String> {
    let remote = peer.snapshots(filesystem).await?;
    let local = ctx.metadata.snapshots(filesystem).await?;

    let (from, to) = match plan_transfer(filesystem, &local, &remote, request.target_commit.as_deref())? {
        Plan::UpToDate => {
            peer.submit(filesystem, Event::new("abort-push")).await?;
            return Ok(format!("{} is up to date on {}", filesystem, request.peer));
        }
        Plan::Send { from, to } => (from, to),
    };

    ctx.transfers.running(&id, 1, &from, &to, format!("pushing {}..{}", from, to));
    let url = peer.replication_url(filesystem, &from, &to);

    with_retry(ctx.config.transfer.retry, "push", || async {
        let stream = open_send_stream(ctx, filesystem, &from, &to, Some(track_progress(ctx, id))).await?;
        let response = peer
            .authed(peer.http().post(&url))
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: url.clone(),
                reason: e.to_string(),
            })?;
        check_status(response).await.map(|_| ())
    })
    .await?;

    Ok(format!("pushed {}..{} to {}", from, to, request.peer))
}

async fn pull(
    ctx: &Arc<NodeContext>,
    peer: &Peer<'_>,
    filesystem: &str,
    id: Uuid,
    request: &TransferRequest,
) -> Result<String> {
    let policy = ctx.config.transfer.retry;
    let remote = with_retry(policy, "list snapshots", || peer.snapshots(filesystem)).await?;
    let local = ctx.metadata.snapshots(filesystem).await?;

    let (from, to) = match plan_transfer(filesystem, &remote, &local, request.target_commit.as_deref())? {
        Plan::UpToDate => return Ok(format!("{} is up to date", filesystem)),
        Plan::Send { from, to } => (from, to),
    };

    let _guard = ctx.receives.try_acquire(filesystem)?;
    ctx.transfers.running(&id, 1, &from, &to, format!("pulling {}..{}", from, to));
    let url = peer.replication_url(filesystem, &from, &to);

    let response = with_retry(policy, "pull", || async {
        let response = peer
            .authed(peer.http().get(&url))
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: url.clone(),
                reason: e.to_string(),
            })?;
        check_status(response).await
    })
    .await?;

    let reader = StreamReader::new(Box::pin(response.bytes_stream().map_err(std::io::Error::other)));
    receive_stream(ctx, filesystem, &from, reader, Some(track_progress(ctx, id))).await?;

    Ok(format!("pulled {}..{} from {}", from, to, request.peer))
}

/// Progress sender feeding a transfer's poll result
fn track_progress(ctx: &Arc<NodeContext>, id: Uuid) -> mpsc::Sender<Progress> {
    let (tx, mut rx) = mpsc::channel::<Progress>(ctx.config.transfer.progress_depth);
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            ctx.transfers.progress(&id, progress.bytes);
        }
    });
    tx
}

/// A 404 from a peer means "not master" or "wrong state"
fn is_not_ready(e: &Error) -> bool {
    e.is_state_mismatch() || matches!(e, Error::PeerRejected { status: 404, .. })
}

/// Run `op`, retrying not-ready answers as the policy allows
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_not_ready(&e) => match policy.delay_for(attempt) {
                Some(delay) => {
                    tracing::debug!("{} attempt {} not ready ({}), retrying in {:?}", what, attempt, e, delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::PeerRejected {
        status: status.as_u16(),
        body,
    })
}

#[derive(Deserialize)]
struct PeerHealth {
    node_id: String,
}

/// The remote end of a transfer
struct Peer<'a> {
    ctx: &'a NodeContext,
    base: String,
    request: &'a TransferRequest,
}

impl<'a> Peer<'a> {
    fn new(ctx: &'a NodeContext, request: &'a TransferRequest) -> Self {
        Self {
            ctx,
            base: peer_url(&request.peer, ctx.config.api.peer_port),
            request,
        }
    }

    fn http(&self) -> &reqwest::Client {
        &self.ctx.http
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.request.user, Some(&self.request.api_key))
    }

    fn replication_url(&self, filesystem: &str, from: &str, to: &str) -> String {
        format!("{}/filesystems/{}/{}/{}", self.base, filesystem, from, to)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// Node id the peer reports for itself
    async fn node_id(&self) -> Result<String> {
        let url = self.url("/health");
        let response = self.http().get(&url).send().await.map_err(|e| Error::ConnectionFailed {
            address: url.clone(),
            reason: e.to_string(),
        })?;
        let health: PeerHealth = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(health.node_id)
    }

    /// Make sure the volume exists on the peer
    async fn create(&self, filesystem: &str) -> Result<()> {
        let url = self.url(&format!("/volumes/{}", filesystem));
        let response = self
            .authed(self.http().put(&url))
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: url.clone(),
                reason: e.to_string(),
            })?;
        check_status(response).await.map(|_| ())
    }

    async fn submit(&self, filesystem: &str, event: Event) -> Result<Event> {
        let url = self.url(&format!("/volumes/{}/events", filesystem));
        let response = self
            .authed(self.http().post(&url))
            .json(&event)
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: url.clone(),
                reason: e.to_string(),
            })?;
        let answer: Event = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        if answer.is_error() {
            return Err(Error::Transfer(format!(
                "{} answered {}: {}",
                self.request.peer,
                event.name,
                answer.str_arg("error").unwrap_or("unknown error")
            )));
        }
        Ok(answer)
    }

    async fn snapshots(&self, filesystem: &str) -> Result<Vec<Snapshot>> {
        let url = self.url(&format!("/volumes/{}/snapshots", filesystem));
        let response = self
            .authed(self.http().get(&url))
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: url.clone(),
                reason: e.to_string(),
            })?;
        check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))
    }
}
