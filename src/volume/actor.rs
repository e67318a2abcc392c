//! Volume Actor
//!
//! One task per volume owns its state. Events are processed strictly in
//! submission order; each runs the handler for the current
//! `(state, event)` pair, which yields the next state and a single
//! response. Handler errors move the volume to `failed` and never stop
//! the loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::cluster::{DirtyInfo, StateEntry};
use crate::context::NodeContext;
use crate::error::{Error, Result};
use crate::transfer::{client, Direction, TransferRequest};
use crate::volume::{Event, Metadata, Snapshot, Transition, VolumeState};

/// Pending requests per actor before submitters wait
const EVENT_QUEUE_DEPTH: usize = 64;

type ResponseTable = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Event>>>>;

struct Request {
    id: Uuid,
    event: Event,
}

/// Cloneable handle to a running volume actor
#[derive(Clone)]
pub struct VolumeHandle {
    filesystem: String,
    tx: mpsc::Sender<Request>,
    responses: ResponseTable,
    transitions: watch::Receiver<Transition>,
}

impl VolumeHandle {
    pub fn filesystem(&self) -> &str {
        &self.filesystem
    }

    /// Queue an event and wait for the actor's response to it
    pub async fn submit(&self, event: Event) -> Result<Event> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        lock(&self.responses).insert(id, tx);

        if self.tx.send(Request { id, event }).await.is_err() {
            lock(&self.responses).remove(&id);
            return Err(Error::ActorStopped(self.filesystem.clone()));
        }

        rx.await.map_err(|_| Error::ActorStopped(self.filesystem.clone()))
    }

    /// Most recent transition
    pub fn current(&self) -> Transition {
        self.transitions.borrow().clone()
    }

    /// Watch for transitions
    pub fn watch(&self) -> watch::Receiver<Transition> {
        self.transitions.clone()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start the actor for `filesystem`. Must be called inside a runtime.
pub fn spawn(ctx: Arc<NodeContext>, filesystem: &str) -> VolumeHandle {
    let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let initial = Transition::now(VolumeState::Discovering, "starting");
    let (transitions_tx, transitions_rx) = watch::channel(initial);
    let responses: ResponseTable = Arc::default();

    let actor = VolumeActor {
        filesystem: filesystem.to_string(),
        ctx,
        state: VolumeState::Discovering,
        status: "starting".to_string(),
        transitions: transitions_tx,
        responses: Arc::clone(&responses),
        last_transfer: None,
        receive_id: None,
        dirty_bytes: 0,
        size_bytes: 0,
    };
    tokio::spawn(actor.run(rx));

    VolumeHandle {
        filesystem: filesystem.to_string(),
        tx,
        responses,
        transitions: transitions_rx,
    }
}

/// Work an event leaves behind once its response is sent
enum FollowUp {
    Transfer(Uuid, TransferRequest),
}

struct Outcome {
    next: VolumeState,
    status: String,
    response: Event,
    follow_up: Option<FollowUp>,
}

impl Outcome {
    fn to(next: VolumeState, status: impl Into<String>, response: Event) -> Self {
        Self {
            next,
            status: status.into(),
            response,
            follow_up: None,
        }
    }
}

struct VolumeActor {
    filesystem: String,
    ctx: Arc<NodeContext>,
    state: VolumeState,
    status: String,
    transitions: watch::Sender<Transition>,
    responses: ResponseTable,
    last_transfer: Option<(Uuid, TransferRequest)>,
    /// Minted on `prepare-for-push`; only the matching completion ends it
    receive_id: Option<Uuid>,
    dirty_bytes: u64,
    size_bytes: u64,
}

impl VolumeActor {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut completed = self.ctx.bus.push_completed.subscribe(&self.filesystem);

        tracing::debug!("Volume actor for {} started", self.filesystem);
        let outcome = match self.discover().await {
            Ok(outcome) => outcome,
            Err(e) => self.failure(&e),
        };
        self.transition(outcome.next, outcome.status).await;

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.dispatch(request).await,
                    None => break,
                },
                Some(receive_id) = completed.recv() => self.on_push_completed(receive_id).await,
            }
        }

        completed.unsubscribe();
        tracing::debug!("Volume actor for {} stopped", self.filesystem);
    }

    async fn dispatch(&mut self, request: Request) {
        tracing::debug!("{} in {}: {}", self.filesystem, self.state, request.event);

        let outcome = match self.handle(&request.event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("{}: {} failed in {}: {}", self.filesystem, request.event.name, self.state, e);
                self.failure(&e)
            }
        };

        self.transition(outcome.next, outcome.status).await;
        self.respond(request.id, outcome.response);

        if let Some(FollowUp::Transfer(id, transfer)) = outcome.follow_up {
            self.run_transfer(id, transfer).await;
        }
    }

    fn respond(&self, id: Uuid, response: Event) {
        let tx = lock(&self.responses).remove(&id);
        if let Some(tx) = tx {
            let _ = tx.send(response);
        }
    }

    fn failure(&self, e: &Error) -> Outcome {
        Outcome::to(VolumeState::Failed, e.to_string(), Event::error(e))
    }

    async fn handle(&mut self, event: &Event) -> Result<Outcome> {
        use VolumeState::*;

        match (self.state, event.name.as_str()) {
            (_, "status") => Ok(Outcome::to(self.state, self.status.clone(), self.status_event())),
            (Active, "snapshot") => self.snapshot(event).await,
            (Active, "transfer") => self.start_transfer(event),
            (Active, "prepare-for-push") => {
                let receive_id = Uuid::new_v4();
                self.receive_id = Some(receive_id);
                Ok(Outcome::to(
                    Receiving,
                    format!("awaiting external push {}", receive_id),
                    Event::new("awaiting-transfer"),
                ))
            }
            (Receiving, "push-completed") => {
                self.ctx.record_snapshots(&self.filesystem).await?;
                Ok(Outcome::to(Active, "push completed", Event::new("push-completed")))
            }
            (Receiving, "abort-push") => Ok(Outcome::to(Active, "push aborted", Event::new("push-aborted"))),
            (Active, "move") => self.move_master(event).await,
            (Active | Inactive, "update-dirty") => self.update_dirty(event).await,
            (Inactive | Failed, "discover" | "reset") => self.discover().await,
            (state, name) => Ok(Outcome::to(
                state,
                self.status.clone(),
                Event::new("unhandled")
                    .with("state", state.to_string())
                    .with("event", name),
            )),
        }
    }

    fn status_event(&self) -> Event {
        let current = self.transitions.borrow().clone();
        let mut event = Event::new("status")
            .with("state", current.state.to_string())
            .with("status", current.status)
            .with("since", current.at)
            .with("dirty_bytes", self.dirty_bytes)
            .with("size_bytes", self.size_bytes);
        if let Some((id, request)) = &self.last_transfer {
            event = event
                .with("transfer_request_id", id)
                .with("transfer_peer", &request.peer);
        }
        event
    }

    /// Load local snapshots and resolve mastership
    async fn discover(&mut self) -> Result<Outcome> {
        self.ctx.record_snapshots(&self.filesystem).await?;

        let master = match self.ctx.cache.master_for(&self.filesystem) {
            Some(master) => master,
            None => {
                let master = self
                    .ctx
                    .store
                    .claim_master(&self.filesystem, &self.ctx.node_id)
                    .await?;
                self.ctx.cache.record_master(&self.filesystem, &master);
                master
            }
        };

        let next = if master == self.ctx.node_id {
            VolumeState::Active
        } else {
            VolumeState::Inactive
        };
        tracing::info!("Discovered {}: master is {}, now {}", self.filesystem, master, next);

        Ok(Outcome::to(
            next,
            format!("master is {}", master),
            Event::new("discovered").with("state", next.to_string()),
        ))
    }

    async fn snapshot(&mut self, event: &Event) -> Result<Outcome> {
        let id = event
            .str_arg("id")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let metadata: Metadata = if event.args.contains_key("metadata") {
            event.arg("metadata")?
        } else {
            Metadata::new()
        };

        self.ctx
            .engine
            .snapshot(self.ctx.runner.as_ref(), &self.filesystem, &id)
            .await?;
        self.ctx
            .metadata
            .append(&self.filesystem, Snapshot { id: id.clone(), metadata })
            .await?;
        self.ctx.record_snapshots(&self.filesystem).await?;

        tracing::info!("Snapshotted {} as {}", self.filesystem, id);
        Ok(Outcome::to(
            VolumeState::Active,
            format!("snapshotted {}", id),
            Event::new("snapshotted").with("id", id),
        ))
    }

    fn start_transfer(&mut self, event: &Event) -> Result<Outcome> {
        let request: TransferRequest = event.arg("request")?;
        if request.peer.is_empty() {
            return Err(Error::Transfer("transfer request has no peer".into()));
        }

        let id = match event.str_arg("transfer_request_id") {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|e| Error::Transfer(format!("invalid transfer_request_id: {}", e)))?,
            None => Uuid::new_v4(),
        };

        self.ctx
            .transfers
            .start(id, &self.filesystem, &self.ctx.node_id, &request);
        self.last_transfer = Some((id, request.clone()));

        let next = match request.direction {
            Direction::Push => VolumeState::Pushing,
            Direction::Pull => VolumeState::Pulling,
        };
        Ok(Outcome {
            next,
            status: format!("transfer {} of {} with {}", id, request.remote_volume(), request.peer),
            response: Event::new("transfer-started").with("transfer_request_id", id),
            follow_up: Some(FollowUp::Transfer(id, request)),
        })
    }

    async fn run_transfer(&mut self, id: Uuid, request: TransferRequest) {
        let outcome = client::run_transfer(&self.ctx, &self.filesystem, id, &request).await;
        self.ctx.transfers.finish(&id, &outcome);

        let status = match &outcome {
            Ok(message) => {
                tracing::info!("Transfer {} of {} finished: {}", id, self.filesystem, message);
                format!("transfer {} finished", id)
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!("Transfer {} of {} failed, may be retried: {}", id, self.filesystem, e);
                format!("transfer {} failed: {}", id, e)
            }
            Err(e) => {
                tracing::warn!("Transfer {} of {} failed: {}", id, self.filesystem, e);
                format!("transfer {} failed: {}", id, e)
            }
        };
        self.transition(VolumeState::Active, status).await;
    }

    async fn move_master(&mut self, event: &Event) -> Result<Outcome> {
        let target = event
            .str_arg("target")
            .ok_or_else(|| Error::Internal("move needs a target node".into()))?
            .to_string();

        if target == self.ctx.node_id {
            return Ok(Outcome::to(
                VolumeState::Active,
                self.status.clone(),
                Event::new("moved").with("target", target),
            ));
        }

        self.ctx.store.put_master(&self.filesystem, &target).await?;
        self.ctx.cache.record_master(&self.filesystem, &target);

        tracing::info!("Moved master of {} to {}", self.filesystem, target);
        Ok(Outcome::to(
            VolumeState::Inactive,
            format!("master is {}", target),
            Event::new("moved").with("target", target),
        ))
    }

    async fn update_dirty(&mut self, event: &Event) -> Result<Outcome> {
        let dirty_bytes: u64 = event.arg("dirty_bytes")?;
        let size_bytes: u64 = event.arg("size_bytes")?;
        self.dirty_bytes = dirty_bytes;
        self.size_bytes = size_bytes;

        let info = DirtyInfo {
            server: self.ctx.node_id.clone(),
            dirty_bytes,
            size_bytes,
        };
        self.ctx.store.put_dirty(&self.filesystem, info.clone()).await?;
        self.ctx.cache.record_dirty(&self.filesystem, info);

        Ok(Outcome::to(self.state, self.status.clone(), Event::new("dirty-updated")))
    }

    async fn on_push_completed(&mut self, receive_id: Uuid) {
        if self.state != VolumeState::Receiving || self.receive_id != Some(receive_id) {
            tracing::debug!(
                "{}: completion of receive {} while {}, ignoring",
                self.filesystem,
                receive_id,
                self.state
            );
            return;
        }
        let outcome = match self.handle(&Event::new("push-completed")).await {
            Ok(outcome) => outcome,
            Err(e) => self.failure(&e),
        };
        self.transition(outcome.next, outcome.status).await;
    }

    /// Record a state change: watchers, the bus, the cache and the store
    async fn transition(&mut self, next: VolumeState, status: String) {
        if next == self.state && status == self.status {
            return;
        }
        if next != self.state {
            tracing::info!("{}: {} -> {} ({})", self.filesystem, self.state, next, status);
        }

        self.state = next;
        self.status = status.clone();
        if next != VolumeState::Receiving {
            self.receive_id = None;
        }

        let transition = Transition::now(next, status).with_receive_id(self.receive_id);
        self.transitions.send_replace(transition.clone());
        self.ctx.bus.transitions.publish(&self.filesystem, transition.clone());

        let entry = StateEntry::from(&transition);
        self.ctx.cache.record_state(&self.filesystem, entry.clone());
        if let Err(e) = self
            .ctx
            .store
            .put_state(&self.filesystem, &self.ctx.node_id, entry)
            .await
        {
            tracing::warn!("Failed to store state of {}: {}", self.filesystem, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_context, transfer_request, MockRunner};
    use std::time::Duration;

    async fn settled(handle: &VolumeHandle) -> VolumeState {
        let mut watch = handle.watch();
        let _ = tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|t| t.state != VolumeState::Discovering),
        )
        .await;
        handle.current().state
    }

    #[tokio::test]
    async fn test_discovery_claims_unowned_volume() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");

        assert_eq!(settled(&handle).await, VolumeState::Active);
        assert_eq!(ctx.cache.master_for("v1").as_deref(), Some("node-1"));
        assert_eq!(ctx.cache.current_state("v1").unwrap().state, VolumeState::Active);
    }

    #[tokio::test]
    async fn test_volume_mastered_elsewhere_is_inactive() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        ctx.cache.record_master("v1", "node-2");
        let handle = ctx.volume("v1");

        assert_eq!(settled(&handle).await, VolumeState::Inactive);
        let response = handle.submit(Event::new("snapshot")).await.unwrap();
        assert_eq!(response.name, "unhandled");
        assert_eq!(response.str_arg("state"), Some("inactive"));
    }

    #[tokio::test]
    async fn test_prepare_and_abort_push() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        let response = handle.submit(Event::new("prepare-for-push")).await.unwrap();
        assert_eq!(response.name, "awaiting-transfer");
        assert_eq!(ctx.cache.current_state("v1").unwrap().state, VolumeState::Receiving);

        let response = handle.submit(Event::new("abort-push")).await.unwrap();
        assert_eq!(response.name, "push-aborted");
        assert_eq!(handle.current().state, VolumeState::Active);
    }

    #[tokio::test]
    async fn test_push_completed_from_bus_returns_to_active() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;
        handle.submit(Event::new("prepare-for-push")).await.unwrap();

        let receive_id = handle.current().receive_id.unwrap();
        let mut watch = handle.watch();
        ctx.bus.push_completed.publish("v1", receive_id);
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|t| t.state == VolumeState::Active),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_late_completion_does_not_end_next_receive() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        handle.submit(Event::new("prepare-for-push")).await.unwrap();
        let aborted = handle.current().receive_id.unwrap();
        handle.submit(Event::new("abort-push")).await.unwrap();
        assert_eq!(handle.current().receive_id, None);

        // Completion of the aborted receive arrives alongside a new prepare
        ctx.bus.push_completed.publish("v1", aborted);
        let response = handle.submit(Event::new("prepare-for-push")).await.unwrap();
        assert_eq!(response.name, "awaiting-transfer");
        ctx.bus.push_completed.publish("v1", Uuid::new_v4());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = handle.submit(Event::new("status")).await.unwrap();
        assert_eq!(status.str_arg("state"), Some("receiving"));
        let current = handle.current().receive_id.unwrap();
        assert_ne!(current, aborted);

        let mut watch = handle.watch();
        ctx.bus.push_completed.publish("v1", current);
        tokio::time::timeout(
            Duration::from_secs(5),
            watch.wait_for(|t| t.state == VolumeState::Active),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_runs_engine_and_publishes() {
        let runner = MockRunner::new();
        let (ctx, _dir) = test_context(runner.clone()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        let mut published = ctx.bus.new_snapshots.subscribe("v1");
        let response = handle
            .submit(Event::new("snapshot").with("id", "s1").with(
                "metadata",
                Metadata::from([("message".to_string(), "first".to_string())]),
            ))
            .await
            .unwrap();
        assert_eq!(response.name, "snapshotted");
        assert_eq!(response.str_arg("id"), Some("s1"));

        assert_eq!(runner.commands()[0].args, vec!["snapshot", "pool/dmfs/v1@s1"]);
        let snapshots = published.recv().await.unwrap();
        assert_eq!(snapshots[0].metadata["message"], "first");
        assert_eq!(ctx.cache.snapshots_for("node-1", "v1").len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_fails_volume_and_reset_recovers() {
        let runner = MockRunner::new().fail_snapshots("dataset is busy");
        let (ctx, _dir) = test_context(runner).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        let response = handle.submit(Event::new("snapshot").with("id", "s1")).await.unwrap();
        assert!(response.is_error());
        assert!(response.str_arg("error").unwrap().contains("dataset is busy"));
        assert_eq!(handle.current().state, VolumeState::Failed);

        let response = handle.submit(Event::new("reset")).await.unwrap();
        assert_eq!(response.name, "discovered");
        assert_eq!(handle.current().state, VolumeState::Active);
    }

    #[tokio::test]
    async fn test_update_dirty_and_move() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        let response = handle
            .submit(Event::new("update-dirty").with("dirty_bytes", 10u64).with("size_bytes", 100u64))
            .await
            .unwrap();
        assert_eq!(response.name, "dirty-updated");
        assert_eq!(ctx.cache.dirty_for("v1").unwrap().size_bytes, 100);

        let response = handle.submit(Event::new("move").with("target", "node-2")).await.unwrap();
        assert_eq!(response.name, "moved");
        assert_eq!(handle.current().state, VolumeState::Inactive);
        assert_eq!(ctx.cache.master_for("v1").as_deref(), Some("node-2"));

        let response = handle
            .submit(Event::new("update-dirty").with("dirty_bytes", 0u64).with("size_bytes", 120u64))
            .await
            .unwrap();
        assert_eq!(response.name, "dirty-updated");
    }

    #[tokio::test]
    async fn test_concurrent_submitters_get_their_own_answers() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("s{}", i);
                let response = handle.submit(Event::new("snapshot").with("id", id.clone())).await.unwrap();
                (id, response)
            }));
        }
        for task in tasks {
            let (id, response) = task.await.unwrap();
            assert_eq!(response.str_arg("id"), Some(id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_failed_transfer_returns_to_active_with_error_result() {
        let (ctx, _dir) = test_context(MockRunner::new()).await;
        let handle = ctx.volume("v1");
        settled(&handle).await;

        // Nothing listens on the peer address
        let mut request = transfer_request(Direction::Push);
        request.peer = "127.0.0.1:1".into();
        let response = handle
            .submit(Event::new("transfer").with("request", &request))
            .await
            .unwrap();
        assert_eq!(response.name, "transfer-started");
        let id: Uuid = response.arg("transfer_request_id").unwrap();

        // Queued behind the transfer
        let status = handle.submit(Event::new("status")).await.unwrap();
        assert_eq!(status.str_arg("state"), Some("active"));

        let result = ctx.transfers.get(&id).unwrap();
        assert_eq!(result.status, crate::transfer::TransferStatus::Error);
    }
}
