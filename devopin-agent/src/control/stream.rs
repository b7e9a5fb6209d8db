//! Live log followers bound to control connections.

use std::{
    collections::HashMap,
    io,
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use devopin_proto::{
    LogLevel,
    msg::{EndReason, Frame, StreamEvent, StreamId},
};
use log::{debug, trace, warn};
use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use serde_json::{Map, Value, json};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

pub type ConnectionId = u64;

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("unable to start log follower: {0}")]
    Spawn(#[from] io::Error),
    #[error("log follower has no output pipe")]
    NoOutput,
    #[error("connection closed before the stream started")]
    ConnectionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub stream_id: StreamId,
    pub service: String,
    pub connection_id: ConnectionId,
    pub pid: Option<u32>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug)]
struct StreamHandle {
    info: StreamInfo,
    /// Outbound queue of the owning connection.
    sink: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<StreamId, StreamHandle>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<StreamId, StreamHandle>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

/// Registry of running followers. Its lock is never held across an await.
#[derive(Debug)]
pub struct StreamManager {
    streams: Registry,
    grace: Duration,
}

impl StreamManager {
    pub fn new(grace: Duration) -> Self {
        StreamManager {
            streams: Arc::default(),
            grace,
        }
    }

    /// Spawns `command` and forwards its stdout to `sink`.
    ///
    /// `logs_stream_started` is queued on `sink` before any data frame.
    pub async fn start(
        &self,
        service: &str,
        connection_id: ConnectionId,
        mut command: Command,
        sink: mpsc::Sender<Frame>,
    ) -> Result<StreamId, StreamError> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().ok_or(StreamError::NoOutput)?;
        let pid = child.id();

        let stream_id = {
            let streams = lock(&self.streams);
            std::iter::repeat_with(StreamId::random)
                .find(|id| !streams.contains_key(id))
                .unwrap_or_else(StreamId::random)
        };

        let started = StreamEvent::LogsStreamStarted {
            stream_id: stream_id.clone(),
            service: service.to_owned(),
        };
        if sink.send(started.into()).await.is_err() {
            terminate(&mut child, pid, self.grace).await;
            return Err(StreamError::ConnectionClosed);
        }

        let cancel = CancellationToken::new();
        let info = StreamInfo {
            stream_id: stream_id.clone(),
            service: service.to_owned(),
            connection_id,
            pid,
            created_at: OffsetDateTime::now_utc(),
        };
        // the registry entry must exist before the task can try to remove it
        let mut streams = lock(&self.streams);
        let task = tokio::spawn(forward(
            stream_id.clone(),
            child,
            pid,
            stdout,
            sink.clone(),
            cancel.clone(),
            self.streams.clone(),
            self.grace,
        ));
        streams.insert(
            stream_id.clone(),
            StreamHandle {
                info,
                sink,
                cancel,
                task,
            },
        );
        drop(streams);

        debug!("stream {stream_id} started for {service} (pid {pid:?})");
        Ok(stream_id)
    }

    /// Stops one stream on behalf of `requester`. Returns `false` if it was
    /// not running.
    ///
    /// When another connection owns the stream, the owner is sent
    /// `logs_stream_ended{stopped}`; the requester answers for itself.
    pub async fn stop(&self, stream_id: &StreamId, requester: ConnectionId) -> bool {
        let Some(handle) = lock(&self.streams).remove(stream_id) else {
            return false;
        };
        let owner = handle.info.connection_id;
        let sink = handle.sink.clone();
        shut(handle).await;
        if owner != requester {
            debug!("stream {stream_id} of connection {owner} stopped by connection {requester}");
            let ended = StreamEvent::LogsStreamEnded {
                stream_id: Some(stream_id.clone()),
                reason: EndReason::Stopped,
            };
            // a slow owner must not hold up the requester
            tokio::spawn(async move {
                let _ = sink.send(ended.into()).await;
            });
        }
        true
    }

    /// Stops every stream owned by `connection_id`.
    pub async fn stop_connection(&self, connection_id: ConnectionId) -> Vec<StreamId> {
        let handles: Vec<_> = {
            let mut streams = lock(&self.streams);
            let ids: Vec<_> = streams
                .values()
                .filter(|h| h.info.connection_id == connection_id)
                .map(|h| h.info.stream_id.clone())
                .collect();
            ids.iter().filter_map(|id| streams.remove(id)).collect()
        };
        let ids = handles.iter().map(|h| h.info.stream_id.clone()).collect();
        futures_util::future::join_all(handles.into_iter().map(shut)).await;
        ids
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = lock(&self.streams).drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            debug!("stopping {} stream(s)", handles.len());
        }
        futures_util::future::join_all(handles.into_iter().map(shut)).await;
    }

    pub fn owns_any(&self, connection_id: ConnectionId) -> bool {
        lock(&self.streams)
            .values()
            .any(|h| h.info.connection_id == connection_id)
    }

    pub fn active(&self) -> Vec<StreamInfo> {
        lock(&self.streams).values().map(|h| h.info.clone()).collect()
    }
}

async fn shut(handle: StreamHandle) {
    handle.cancel.cancel();
    if let Err(e) = handle.task.await {
        warn!("stream {} task failed: {e}", handle.info.stream_id);
    }
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    stream_id: StreamId,
    mut child: Child,
    pid: Option<u32>,
    stdout: tokio::process::ChildStdout,
    sink: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    registry: Registry,
    grace: Duration,
) {
    let mut lines = BufReader::new(stdout).lines();
    let exited = loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break false,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break true,
            Err(e) => {
                debug!("stream {stream_id}: read failed: {e}");
                break true;
            }
        };
        trace!("stream {stream_id}: {line}");

        let frame = StreamEvent::LogsData {
            stream_id: stream_id.clone(),
            data: log_record(&line),
        };
        tokio::select! {
            _ = cancel.cancelled() => break false,
            sent = sink.send(frame.into()) => if sent.is_err() {
                // the connection is gone; its handler stops the stream
                break false;
            },
        }
    };

    terminate(&mut child, pid, grace).await;

    if exited && lock(&registry).remove(&stream_id).is_some() {
        debug!("stream {stream_id}: follower exited");
        let _ = sink
            .send(
                StreamEvent::LogsStreamEnded {
                    stream_id: Some(stream_id),
                    reason: EndReason::ProcessExited,
                }
                .into(),
            )
            .await;
    }
}

/// SIGTERM to the follower's process group, SIGKILL after `grace`.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    let group = pid.and_then(|pid| i32::try_from(pid).ok()).map(Pid::from_raw);
    if let Some(group) = group {
        let _ = killpg(group, Signal::SIGTERM);
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        debug!("follower {pid:?} ignored SIGTERM, killing");
        if let Some(group) = group {
            let _ = killpg(group, Signal::SIGKILL);
        }
        let _ = child.kill().await;
    }
    // reap anything left in the group once the leader is gone
    if let Some(group) = group {
        let _ = killpg(group, Signal::SIGKILL);
    }
}

/// Maps one follower line to a `logs_data` payload. Journal export records
/// are condensed; other JSON is passed through; anything else is raw text.
pub fn log_record(line: &str) -> Value {
    let Ok(Value::Object(record)) = serde_json::from_str::<Value>(line) else {
        return json!({ "raw": line });
    };
    if !record.contains_key("MESSAGE") {
        return Value::Object(record);
    }

    let field = |name: &str| record.get(name).and_then(Value::as_str);
    let message = match record.get("MESSAGE") {
        Some(Value::String(text)) => text.clone(),
        // journald encodes non-UTF-8 messages as byte arrays
        Some(Value::Array(bytes)) => {
            let bytes: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
        _ => String::new(),
    };
    let priority = field("PRIORITY").and_then(|p| p.parse::<u8>().ok());
    let timestamp = field("__REALTIME_TIMESTAMP")
        .and_then(|usec| usec.parse::<i128>().ok())
        .and_then(|usec| OffsetDateTime::from_unix_timestamp_nanos(usec * 1000).ok())
        .and_then(|ts| ts.format(&Rfc3339).ok());

    let mut out = Map::new();
    out.insert("timestamp".to_owned(), json!(timestamp));
    out.insert("message".to_owned(), json!(message));
    out.insert(
        "level".to_owned(),
        json!(priority.map_or(LogLevel::Unknown, LogLevel::from_syslog_priority)),
    );
    out.insert("priority".to_owned(), json!(priority));
    out.insert("pid".to_owned(), json!(field("_PID")));
    out.insert("unit".to_owned(), json!(field("_SYSTEMD_UNIT")));
    out.insert("identifier".to_owned(), json!(field("SYSLOG_IDENTIFIER")));
    Value::Object(out)
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn alive(pid: Option<u32>) -> bool {
        Path::new(&format!("/proc/{}", pid.unwrap())).exists()
    }

    async fn recv(rx: &mut mpsc::Receiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("sender alive")
    }

    #[test]
    fn test_log_record_shapes() {
        let journal = log_record(
            r#"{"MESSAGE":"upstream timed out","PRIORITY":"3","__REALTIME_TIMESTAMP":"1700000000000000","_PID":"42","_SYSTEMD_UNIT":"nginx.service"}"#,
        );
        assert_eq!(journal["message"], "upstream timed out");
        assert_eq!(journal["level"], "ERROR");
        assert_eq!(journal["priority"], 3);
        assert_eq!(journal["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(journal["unit"], "nginx.service");

        let bytes = log_record(r#"{"MESSAGE":[104,105]}"#);
        assert_eq!(bytes["message"], "hi");

        assert_eq!(log_record(r#"{"msg":"pino"}"#), json!({"msg": "pino"}));
        assert_eq!(log_record("plain text"), json!({"raw": "plain text"}));
    }

    #[tokio::test]
    async fn test_stream_forwards_lines_and_stops() {
        let manager = StreamManager::new(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(16);
        let id = manager
            .start(
                "nginx",
                1,
                sh(r#"echo '{"MESSAGE":"hello","PRIORITY":"6"}'; echo plain; sleep 30"#),
                tx,
            )
            .await
            .unwrap();

        match recv(&mut rx).await {
            Frame::Event(StreamEvent::LogsStreamStarted { stream_id, service }) => {
                assert_eq!(stream_id, id);
                assert_eq!(service, "nginx");
            }
            other => panic!("unexpected {other:?}"),
        }
        match recv(&mut rx).await {
            Frame::Event(StreamEvent::LogsData { data, .. }) => assert_eq!(data["message"], "hello"),
            other => panic!("unexpected {other:?}"),
        }
        match recv(&mut rx).await {
            Frame::Event(StreamEvent::LogsData { data, .. }) => assert_eq!(data["raw"], "plain"),
            other => panic!("unexpected {other:?}"),
        }

        let pid = manager.active()[0].pid;
        assert!(alive(pid));
        assert!(manager.stop(&id, 1).await);
        assert!(!alive(pid));
        assert!(manager.active().is_empty());

        // stopping twice is a no-op
        assert!(!manager.stop(&id, 1).await);
        // the owner answers its own stop, nothing else is queued
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_from_other_connection_tells_owner() {
        let manager = StreamManager::new(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(16);
        let id = manager.start("nginx", 1, sh("sleep 30"), tx).await.unwrap();
        assert!(matches!(
            recv(&mut rx).await,
            Frame::Event(StreamEvent::LogsStreamStarted { .. })
        ));

        assert!(manager.stop(&id, 2).await);
        assert_eq!(
            recv(&mut rx).await,
            Frame::Event(StreamEvent::LogsStreamEnded {
                stream_id: Some(id),
                reason: EndReason::Stopped,
            })
        );
        assert!(manager.active().is_empty());
    }

    #[tokio::test]
    async fn test_exited_follower_ends_stream() {
        let manager = StreamManager::new(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(16);
        let id = manager.start("redis", 1, sh("echo bye"), tx).await.unwrap();

        let mut frames = Vec::new();
        loop {
            let frame = recv(&mut rx).await;
            let done = matches!(frame, Frame::Event(StreamEvent::LogsStreamEnded { .. }));
            frames.push(frame);
            if done {
                break;
            }
        }
        assert_eq!(
            frames.last(),
            Some(&Frame::Event(StreamEvent::LogsStreamEnded {
                stream_id: Some(id),
                reason: EndReason::ProcessExited,
            }))
        );
        assert!(manager.active().is_empty());
    }

    #[tokio::test]
    async fn test_connection_close_leaves_no_processes() {
        let manager = StreamManager::new(Duration::from_millis(300));
        let (tx, _rx) = mpsc::channel(64);
        // the second follower ignores SIGTERM and has to be killed
        manager
            .start("a", 7, sh("while :; do echo a; sleep 0.1; done"), tx.clone())
            .await
            .unwrap();
        manager
            .start("b", 7, sh("trap '' TERM; while :; do sleep 0.1; done"), tx.clone())
            .await
            .unwrap();
        manager
            .start("c", 8, sh("sleep 30"), tx)
            .await
            .unwrap();

        let pids: Vec<_> = manager
            .active()
            .iter()
            .filter(|s| s.connection_id == 7)
            .map(|s| s.pid)
            .collect();
        assert_eq!(pids.len(), 2);

        let stopped = manager.stop_connection(7).await;
        assert_eq!(stopped.len(), 2);
        assert!(pids.iter().all(|pid| !alive(*pid)));
        assert!(!manager.owns_any(7));
        assert!(manager.owns_any(8));

        manager.stop_all().await;
        assert!(manager.active().is_empty());
    }
}
