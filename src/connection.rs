//! Device Connection: owns one TCP socket to one `(module, port)` address on
//! a Global Cache device, serializing requests and correlating responses
//! (§4.3). Sockets are one-per-port (§9 design note): a connection only
//! ever talks about its own port, so per-port serialization falls out of
//! the connection simply never writing a second request before the first
//! has completed, errored, or timed out.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::address::{DeviceEndpoint, LogicalAddress};
use crate::codec::{self, ResponseFrame, SendIrCommand};
use crate::error::{DispatchError, Result};
use crate::keyset::IRWaveform;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(2);
const SENDIR_MARGIN: Duration = Duration::from_secs(2);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 16;
const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;
const IGNORED_IDS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Draining,
    Faulted,
}

#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub state: ConnectionState,
    pub last_ok_at: Option<chrono::DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error_kind: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_ok_at: None,
            consecutive_failures: 0,
            last_error_kind: None,
        }
    }
}

type SharedHealth = Arc<StdMutex<HealthRecord>>;

enum Outbound {
    SendIr {
        waveform: IRWaveform,
        repeat: u32,
        respond: oneshot::Sender<Result<()>>,
    },
    HealthCheck {
        respond: oneshot::Sender<Result<()>>,
    },
}

/// A handle to a running Device Connection actor. Cloneable; all clones
/// share the same underlying socket and pending-request table.
#[derive(Clone)]
pub struct DeviceConnection {
    pub address: LogicalAddress,
    cmd_tx: mpsc::Sender<Outbound>,
    stop_tx: mpsc::Sender<()>,
    health: SharedHealth,
    shutdown_tx: watch::Sender<bool>,
    actor: Arc<JoinHandle<()>>,
}

impl DeviceConnection {
    pub fn spawn(endpoint: DeviceEndpoint, address: LogicalAddress) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = mpsc::channel(QUEUE_CAPACITY);
        let health: SharedHealth = Arc::new(StdMutex::new(HealthRecord::default()));
        // `watch` rather than `Notify`: the shutdown flag must persist even
        // if the actor isn't awaiting it yet (e.g. mid-connect), which a
        // one-shot `notify_waiters()` would silently miss.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor_health = health.clone();
        let actor = tokio::spawn(run_connection(
            endpoint,
            address,
            cmd_rx,
            stop_rx,
            actor_health,
            shutdown_rx,
        ));

        Self {
            address,
            cmd_tx,
            stop_tx,
            health,
            shutdown_tx,
            actor: Arc::new(actor),
        }
    }

    /// Whether a close has been requested (§4.3 Draining): new requests are
    /// refused from this point on, even before the actor itself has noticed.
    pub fn is_draining(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Issue a `sendir` for `waveform`, repeated `repeat` times, and await completion.
    pub async fn press(&self, waveform: &IRWaveform, repeat: u32) -> Result<()> {
        if self.is_draining() {
            return Err(DispatchError::NotReady);
        }
        let deadline_ms = waveform.base_duration_ms()
            + repeat as f64 * waveform.repeat_duration_ms()
            + SENDIR_MARGIN.as_millis() as f64;
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .try_send(Outbound::SendIr {
                waveform: waveform.clone(),
                repeat,
                respond,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::DeviceBusy,
                mpsc::error::TrySendError::Closed(_) => DispatchError::LinkLost,
            })?;
        await_with_deadline(rx, Duration::from_millis(deadline_ms.max(0.0) as u64)).await
    }

    /// Issue `getversion,0` and expect any response within 2s (§4.3 Health).
    pub async fn health_check(&self) -> Result<()> {
        if self.is_draining() {
            return Err(DispatchError::NotReady);
        }
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .try_send(Outbound::HealthCheck { respond })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::DeviceBusy,
                mpsc::error::TrySendError::Closed(_) => DispatchError::LinkLost,
            })?;
        await_with_deadline(rx, HEALTHCHECK_TIMEOUT).await
    }

    /// Best-effort `stopir`; does not wait for any acknowledgement since the
    /// protocol defines none (§4.2 lists no stopir response).
    pub async fn stop(&self) -> Result<()> {
        self.stop_tx.send(()).await.map_err(|_| DispatchError::LinkLost)
    }

    pub fn health(&self) -> HealthRecord {
        self.health.lock().unwrap().clone()
    }

    /// Transition to Draining and wait (up to `deadline`) for in-flight
    /// completions before the socket is released (§4.3, §9).
    pub async fn shutdown(&self, deadline: Duration) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(deadline, async {
            while !self.actor.is_finished() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
    }
}

async fn await_with_deadline(rx: oneshot::Receiver<Result<()>>, deadline: Duration) -> Result<()> {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(DispatchError::LinkLost),
        Err(_) => Err(DispatchError::Timeout),
    }
}

enum PendingKind {
    Addressed(u16),
    Unaddressed,
}

struct Pending {
    kind: PendingKind,
    respond: oneshot::Sender<Result<()>>,
    deadline: Instant,
}

enum SessionOutcome {
    Drained,
    Faulted,
}

enum ReaderEvent {
    Frame(ResponseFrame),
    Eof,
    Error(String),
}

async fn run_connection(
    endpoint: DeviceEndpoint,
    address: LogicalAddress,
    mut cmd_rx: mpsc::Receiver<Outbound>,
    mut stop_rx: mpsc::Receiver<()>,
    health: SharedHealth,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let id_counter = AtomicU32::new(0);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        set_state(&health, ConnectionState::Connecting);
        let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.tcp_port));
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                set_faulted(&health, &format!("connect failed: {e}"));
                if wait_backoff_or_shutdown(&mut backoff, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
            Err(_) => {
                set_faulted(&health, "connect timed out");
                if wait_backoff_or_shutdown(&mut backoff, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };

        set_state(&health, ConnectionState::Ready);
        backoff = INITIAL_BACKOFF;

        let outcome = run_session(
            stream,
            address,
            &mut cmd_rx,
            &mut stop_rx,
            &health,
            &mut shutdown_rx,
            &id_counter,
        )
        .await;

        match outcome {
            SessionOutcome::Drained => {
                set_state(&health, ConnectionState::Disconnected);
                return;
            }
            SessionOutcome::Faulted => {
                if wait_backoff_or_shutdown(&mut backoff, &mut shutdown_rx).await {
                    set_state(&health, ConnectionState::Disconnected);
                    return;
                }
            }
        }
    }
}

/// Sleep for the current (jittered) backoff, doubling it for next time,
/// unless a shutdown is requested mid-sleep. Returns true if shutdown won.
async fn wait_backoff_or_shutdown(
    backoff: &mut Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    let sleep_for = backoff.mul_f64(jitter);
    let result = tokio::select! {
        _ = tokio::time::sleep(sleep_for) => false,
        _ = shutdown_rx.changed() => true,
    };
    *backoff = (*backoff * 2).min(MAX_BACKOFF);
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_session(
    stream: TcpStream,
    address: LogicalAddress,
    cmd_rx: &mut mpsc::Receiver<Outbound>,
    stop_rx: &mut mpsc::Receiver<()>,
    health: &SharedHealth,
    shutdown_rx: &mut watch::Receiver<bool>,
    id_counter: &AtomicU32,
) -> SessionOutcome {
    let (read_half, mut write_half) = stream.into_split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<ReaderEvent>(32);

    let reader_handle = tokio::spawn(async move {
        let mut reader = BufReader::new(read_half);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\r', &mut buf).await {
                Ok(0) => {
                    let _ = frame_tx.send(ReaderEvent::Eof).await;
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    let frame = codec::parse_line(&line);
                    if frame_tx.send(ReaderEvent::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = frame_tx.send(ReaderEvent::Error(e.to_string())).await;
                    break;
                }
            }
        }
    });

    let mut pending: Option<Pending> = None;
    let mut ignored_ids: VecDeque<u16> = VecDeque::with_capacity(IGNORED_IDS_CAPACITY);
    let mut consecutive_timeouts: u32 = 0;
    let mut draining = *shutdown_rx.borrow();

    if draining {
        reader_handle.abort();
        return SessionOutcome::Drained;
    }

    let outcome = loop {
        // A real `Sleep`, far in the future when nothing is pending; the
        // `if pending.is_some()` guard keeps it from ever firing in that case.
        // Constructing it inline (rather than behind an indirection) matters:
        // `select!` polls this same instance repeatedly within one iteration,
        // and a `Sleep` deregisters its timer entry on drop.
        let next_deadline = pending
            .as_ref()
            .map(|p| p.deadline)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(365 * 24 * 3600));

        tokio::select! {
            biased;

            _ = shutdown_rx.changed(), if !draining => {
                draining = true;
                if pending.is_none() {
                    break SessionOutcome::Drained;
                }
            }

            Some(()) = stop_rx.recv() => {
                let _ = write_half.write_all(codec::stopir_line(address).as_bytes()).await;
                tracing::info!(%address, "issued stopir");
            }

            maybe_event = frame_rx.recv() => {
                match maybe_event {
                    Some(ReaderEvent::Frame(frame)) => {
                        handle_frame(frame, &mut pending, &mut ignored_ids, health, &mut consecutive_timeouts);
                        if pending.is_none() && draining {
                            break SessionOutcome::Drained;
                        }
                    }
                    Some(ReaderEvent::Eof) | Some(ReaderEvent::Error(_)) | None => {
                        if let Some(p) = pending.take() {
                            let _ = p.respond.send(Err(DispatchError::LinkLost));
                        }
                        set_faulted(health, "link lost");
                        break SessionOutcome::Faulted;
                    }
                }
            }

            _ = tokio::time::sleep_until(next_deadline), if pending.is_some() => {
                if let Some(p) = pending.take() {
                    let _ = p.respond.send(Err(DispatchError::Timeout));
                    if let PendingKind::Addressed(id) = p.kind {
                        push_ignored(&mut ignored_ids, id);
                    }
                }
                consecutive_timeouts += 1;
                mark_failure(health, "timeout");
                if consecutive_timeouts >= MAX_CONSECUTIVE_TIMEOUTS {
                    set_faulted(health, "repeated timeouts");
                    break SessionOutcome::Faulted;
                }
                if draining {
                    break SessionOutcome::Drained;
                }
            }

            maybe_cmd = cmd_rx.recv(), if pending.is_none() && !draining => {
                match maybe_cmd {
                    None => break SessionOutcome::Drained,
                    Some(outbound) => {
                        let (line, new_pending) = build_outbound(outbound, address, id_counter);
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            let _ = new_pending.respond.send(Err(DispatchError::LinkLost));
                            set_faulted(health, "write failed");
                            break SessionOutcome::Faulted;
                        }
                        pending = Some(new_pending);
                    }
                }
            }

            // Caller abandoned the in-flight request (dropped its receiver):
            // a press already on the wire gets a best-effort stopir (§5
            // Cancellation); an abandoned query has nothing to cancel on the
            // wire, so it's just dropped.
            _ = pending_closed(&pending) => {
                if let Some(p) = pending.take() {
                    if let PendingKind::Addressed(id) = p.kind {
                        push_ignored(&mut ignored_ids, id);
                        let _ = write_half.write_all(codec::stopir_line(address).as_bytes()).await;
                        tracing::info!(%address, "caller cancelled, issued best-effort stopir");
                    }
                }
            }
        }
    };

    reader_handle.abort();
    outcome
}

/// Resolves once the current pending's receiver is dropped; never resolves
/// if there is no pending request.
async fn pending_closed(pending: &Option<Pending>) {
    match pending {
        Some(p) => p.respond.closed().await,
        None => std::future::pending().await,
    }
}

fn build_outbound(
    outbound: Outbound,
    address: LogicalAddress,
    id_counter: &AtomicU32,
) -> (String, Pending) {
    match outbound {
        Outbound::SendIr {
            waveform,
            repeat,
            respond,
        } => {
            let id = next_id(id_counter);
            let cmd = SendIrCommand::new(address, id, &waveform, repeat);
            let deadline_ms = waveform.base_duration_ms()
                + repeat as f64 * waveform.repeat_duration_ms()
                + SENDIR_MARGIN.as_millis() as f64;
            let pending = Pending {
                kind: PendingKind::Addressed(id),
                respond,
                deadline: Instant::now() + Duration::from_millis(deadline_ms.max(0.0) as u64),
            };
            (cmd.to_wire_line(), pending)
        }
        Outbound::HealthCheck { respond } => {
            let pending = Pending {
                kind: PendingKind::Unaddressed,
                respond,
                deadline: Instant::now() + HEALTHCHECK_TIMEOUT,
            };
            (codec::getversion_line(), pending)
        }
    }
}

fn next_id(counter: &AtomicU32) -> u16 {
    let prev = counter.fetch_add(1, Ordering::Relaxed);
    ((prev % 65535) + 1) as u16
}

fn push_ignored(ignored: &mut VecDeque<u16>, id: u16) {
    if ignored.len() >= IGNORED_IDS_CAPACITY {
        ignored.pop_front();
    }
    ignored.push_back(id);
}

fn handle_frame(
    frame: ResponseFrame,
    pending: &mut Option<Pending>,
    ignored_ids: &mut VecDeque<u16>,
    health: &SharedHealth,
    consecutive_timeouts: &mut u32,
) {
    match frame {
        ResponseFrame::CompleteIr { id, .. } => {
            if matches_addressed(pending, id) {
                let p = pending.take().unwrap();
                *consecutive_timeouts = 0;
                mark_ok(health);
                let _ = p.respond.send(Ok(()));
            } else if ignored_ids.contains(&id) {
                tracing::debug!(id, "completeir for cancelled/stale id ignored");
            } else {
                tracing::warn!(id, "unsolicited completeir ignored");
            }
        }
        ResponseFrame::BusyIr { id, .. } => {
            if matches_addressed(pending, id) {
                tracing::debug!(id, "device reports busy, awaiting completeir");
            } else {
                tracing::debug!(id, "busyIR for unknown id ignored");
            }
        }
        ResponseFrame::DeviceError { code, .. } => {
            if let Some(p) = pending.take() {
                mark_failure(health, "device error");
                let _ = p
                    .respond
                    .send(Err(DispatchError::DeviceError(code.unwrap_or(0))));
            }
        }
        ResponseFrame::IrLearnerEnabled => {
            if let Some(p) = pending.take() {
                mark_failure(health, "IR learner enabled");
                let _ = p.respond.send(Err(DispatchError::DeviceError(0)));
            }
        }
        ResponseFrame::Device { .. }
        | ResponseFrame::EndListDevices
        | ResponseFrame::Informational(_) => {
            if matches!(
                pending.as_ref().map(|p| &p.kind),
                Some(PendingKind::Unaddressed)
            ) {
                let p = pending.take().unwrap();
                *consecutive_timeouts = 0;
                mark_ok(health);
                let _ = p.respond.send(Ok(()));
            }
        }
    }
}

fn matches_addressed(pending: &Option<Pending>, id: u16) -> bool {
    matches!(pending.as_ref().map(|p| &p.kind), Some(PendingKind::Addressed(pid)) if *pid == id)
}

fn set_state(health: &SharedHealth, state: ConnectionState) {
    let mut h = health.lock().unwrap();
    h.state = state;
}

fn mark_ok(health: &SharedHealth) {
    let mut h = health.lock().unwrap();
    h.last_ok_at = Some(Utc::now());
    h.consecutive_failures = 0;
    h.last_error_kind = None;
}

fn mark_failure(health: &SharedHealth, kind: &str) {
    let mut h = health.lock().unwrap();
    h.consecutive_failures += 1;
    h.last_error_kind = Some(kind.to_string());
}

fn set_faulted(health: &SharedHealth, kind: &str) {
    let mut h = health.lock().unwrap();
    h.state = ConnectionState::Faulted;
    h.consecutive_failures += 1;
    h.last_error_kind = Some(kind.to_string());
}
