//! Local control channel: newline-delimited JSON over a unix socket.

use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use devopin_proto::{
    ServiceStatus,
    msg::{
        Command, CommandError, EndReason, ErrorCode, Frame, Reply, Request, StreamEvent, StreamId,
    },
};
use log::{debug, error, info, warn};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::mpsc,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    service::{ServiceAction, ServiceError, ServiceManager, ServiceMonitor, is_valid_service_name},
    state::SharedState,
};

pub mod stream;

use stream::{ConnectionId, StreamManager};

const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control socket {} is already served by another agent", .0.display())]
    InUse(PathBuf),
    #[error("unable to prepare control socket {}: {source}", .path.display())]
    Prepare { path: PathBuf, source: io::Error },
    #[error("unable to bind control socket {}: {source}", .path.display())]
    Bind { path: PathBuf, source: io::Error },
}

/// A request line that cannot be turned into a [`Command`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
}

fn parse_command(line: &str) -> Result<Command, ProtocolError> {
    let request: Request = serde_json::from_str(line)?;
    Ok(Command::try_from(request)?)
}

/// Creates the socket directory and removes a stale socket file. A socket
/// that still accepts connections belongs to a live agent and is an error.
fn prepare_socket(path: &Path) -> Result<(), ControlError> {
    let prepare = |source| ControlError::Prepare {
        path: path.to_owned(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(prepare)?;
    }
    if path.exists() {
        match std::os::unix::net::UnixStream::connect(path) {
            Ok(_) => return Err(ControlError::InUse(path.to_owned())),
            Err(_) => {
                debug!("removing stale socket {}", path.display());
                fs::remove_file(path).map_err(prepare)?;
            }
        }
    }
    Ok(())
}

/// Binds the control socket and applies `mode` to the socket file.
pub fn bind(path: &Path, mode: u32) -> Result<UnixListener, ControlError> {
    prepare_socket(path)?;
    let bind_error = |source| ControlError::Bind {
        path: path.to_owned(),
        source,
    };
    let listener = UnixListener::bind(path).map_err(bind_error)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(bind_error)?;
    info!("control channel listening on {} ({mode:o})", path.display());
    Ok(listener)
}

pub fn remove_socket(path: &Path) {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            warn!("unable to remove socket {}: {e}", path.display())
        }
        _ => {}
    }
}

pub struct ControlServer<M> {
    state: Arc<SharedState>,
    services: Arc<ServiceMonitor<M>>,
    streams: StreamManager,
    command_timeout: Duration,
    backlog: usize,
    next_connection: AtomicU64,
}

impl<M: ServiceManager> ControlServer<M> {
    pub fn new(
        state: Arc<SharedState>,
        services: Arc<ServiceMonitor<M>>,
        command_timeout: Duration,
        stream_grace: Duration,
        backlog: usize,
    ) -> Self {
        ControlServer {
            state,
            services,
            streams: StreamManager::new(stream_grace),
            command_timeout,
            backlog,
            next_connection: AtomicU64::new(1),
        }
    }

    #[cfg(test)]
    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Accepts connections until `shutdown` fires. Connections end their
    /// streams with `logs_stream_ended{shutdown}` before closing.
    pub async fn serve(self: Arc<Self>, listener: UnixListener, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
                    tracker.spawn(self.clone().handle_connection(stream, id, shutdown.clone()));
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        tracker.close();
        tracker.wait().await;
        self.streams.stop_all().await;
        debug!("control channel stopped");
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: UnixStream,
        id: ConnectionId,
        shutdown: CancellationToken,
    ) {
        debug!("connection {id} opened");
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let mut line = match serde_json::to_vec(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("unable to encode frame: {e}");
                        continue;
                    }
                };
                line.push(b'\n');
                if let Err(e) = write_half.write_all(&line).await {
                    debug!("connection {id}: write failed: {e}");
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let mut lines = BufReader::new(read_half).lines();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = timeout(self.command_timeout, lines.next_line()) => next,
            };
            let line = match next {
                // idle; a streaming connection may stay quiet
                Err(_) if self.streams.owns_any(id) => continue,
                Err(_) => {
                    debug!("connection {id}: idle timeout");
                    break;
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    debug!("connection {id}: read failed: {e}");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            if !self.handle_line(&line, id, &tx).await {
                break;
            }
        }

        let stopped = self.streams.stop_connection(id).await;
        if !stopped.is_empty() {
            debug!("connection {id}: stopped {} stream(s)", stopped.len());
        }
        if shutdown.is_cancelled() {
            for stream_id in stopped {
                let _ = tx.send(ended(Some(stream_id), EndReason::Shutdown)).await;
            }
        }
        drop(tx);
        let _ = writer.await;
        debug!("connection {id} closed");
    }

    /// Answers one request line. Returns whether the connection stays open.
    async fn handle_line(&self, line: &str, id: ConnectionId, tx: &mpsc::Sender<Frame>) -> bool {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(e) => {
                debug!("connection {id}: {e}");
                let _ = tx
                    .send(Reply::error(ErrorCode::InvalidCommand, e.to_string()).into())
                    .await;
                return false;
            }
        };

        if let Some(service) = command.service()
            && (!is_valid_service_name(service) || !self.state.is_known_service(service))
        {
            let reply = Reply::error(
                ErrorCode::UnknownService,
                format!("service {service:?} is not monitored by this agent"),
            )
            .with_service(Some(service));
            let _ = tx.send(reply.into()).await;
            return self.streams.owns_any(id);
        }

        debug!("connection {id}: {}", command.name());
        let frames = match timeout(self.command_timeout, self.dispatch(command, id, tx)).await {
            Ok(frames) => frames,
            Err(_) => {
                let reply = Reply::error(
                    ErrorCode::Timeout,
                    format!("command did not finish within {:?}", self.command_timeout),
                );
                let _ = tx.send(reply.into()).await;
                return false;
            }
        };
        for frame in frames {
            if tx.send(frame).await.is_err() {
                return false;
            }
        }
        self.streams.owns_any(id)
    }

    async fn dispatch(
        &self,
        command: Command,
        id: ConnectionId,
        tx: &mpsc::Sender<Frame>,
    ) -> Vec<Frame> {
        match command {
            Command::Status { service: None } => {
                let mut reply = Reply::agent(self.state.cached_statuses());
                let streams = self.streams.active().len();
                if streams > 0 {
                    reply.message = Some(format!("agent is running, {streams} active log stream(s)"));
                }
                vec![reply.into()]
            }
            Command::Status {
                service: Some(service),
            } => {
                let reply = self.services.status(&service).await;
                vec![self.service_reply(&service, reply).into()]
            }
            Command::LogsStream { service } => self.start_stream(service, id, tx).await,
            Command::LogsStop {
                stream_id: Some(stream_id),
            } => {
                let reason = if self.streams.stop(&stream_id, id).await {
                    EndReason::Stopped
                } else {
                    EndReason::AlreadyStopped
                };
                vec![ended(Some(stream_id), reason)]
            }
            Command::LogsStop { stream_id: None } => {
                let stopped = self.streams.stop_connection(id).await;
                if stopped.is_empty() {
                    vec![ended(None, EndReason::NoActiveStreams)]
                } else {
                    stopped
                        .into_iter()
                        .map(|stream_id| ended(Some(stream_id), EndReason::Stopped))
                        .collect()
                }
            }
            Command::Start { service } => self.act(&service, ServiceAction::Start).await,
            Command::Stop { service } => self.act(&service, ServiceAction::Stop).await,
            Command::Restart { service } => self.act(&service, ServiceAction::Restart).await,
            Command::Enable { service } => self.act(&service, ServiceAction::Enable).await,
            Command::Disable { service } => self.act(&service, ServiceAction::Disable).await,
        }
    }

    /// Runs the action in its own task so that a reply timeout never cuts
    /// it short; it finishes under the service lock and records the outcome.
    async fn act(&self, service: &str, action: ServiceAction) -> Vec<Frame> {
        let task = tokio::spawn({
            let services = self.services.clone();
            let state = self.state.clone();
            let service = service.to_owned();
            async move {
                let result = services.control(&service, action).await;
                record_outcome(&state, &result);
                result
            }
        });
        let result = task
            .await
            .unwrap_or_else(|e| Err(ServiceError::Spawn(io::Error::other(e))));
        vec![reply_for(service, result).into()]
    }

    fn service_reply(&self, service: &str, result: Result<ServiceStatus, ServiceError>) -> Reply {
        record_outcome(&self.state, &result);
        reply_for(service, result)
    }

    async fn start_stream(
        &self,
        service: String,
        id: ConnectionId,
        tx: &mpsc::Sender<Frame>,
    ) -> Vec<Frame> {
        if let Err(e) = self.services.status(&service).await {
            return vec![self.service_reply(&service, Err(e)).into()];
        }
        let command = self.services.manager().follow_command(&service, self.backlog);
        match self.streams.start(&service, id, command, tx.clone()).await {
            // logs_stream_started was queued by the stream itself
            Ok(stream_id) => {
                info!("connection {id}: streaming {service} as {stream_id}");
                vec![]
            }
            Err(e) => {
                warn!("unable to stream {service}: {e}");
                vec![
                    Reply::error(ErrorCode::Internal, e.to_string())
                        .with_service(Some(service))
                        .into(),
                ]
            }
        }
    }
}

fn record_outcome(state: &SharedState, result: &Result<ServiceStatus, ServiceError>) {
    let status = match result {
        Ok(status) => Some(status),
        Err(e) => e.status(),
    };
    if let Some(status) = status {
        state.record_status(status.clone());
    }
}

fn reply_for(service: &str, result: Result<ServiceStatus, ServiceError>) -> Reply {
    match result {
        Ok(status) => Reply::ok(service, status),
        Err(e) => {
            warn!("{e}");
            let status = e.status().cloned();
            Reply::error(e.code(), e.to_string())
                .with_service(Some(service))
                .with_status(status)
        }
    }
}

fn ended(stream_id: Option<StreamId>, reason: EndReason) -> Frame {
    StreamEvent::LogsStreamEnded { stream_id, reason }.into()
}
