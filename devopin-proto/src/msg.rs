use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::ServiceStatus;

pub const STREAM_ID_LENGTH: usize = 16;

/// Raw control-channel request, one JSON object per line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
}

/// Validated control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status { service: Option<String> },
    Start { service: String },
    Stop { service: String },
    Restart { service: String },
    Enable { service: String },
    Disable { service: String },
    LogsStream { service: String },
    LogsStop { stream_id: Option<StreamId> },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Status { .. } => "status",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Restart { .. } => "restart",
            Command::Enable { .. } => "enable",
            Command::Disable { .. } => "disable",
            Command::LogsStream { .. } => "logs_stream",
            Command::LogsStop { .. } => "logs_stop",
        }
    }

    pub fn service(&self) -> Option<&str> {
        match self {
            Command::Status { service } => service.as_deref(),
            Command::Start { service }
            | Command::Stop { service }
            | Command::Restart { service }
            | Command::Enable { service }
            | Command::Disable { service }
            | Command::LogsStream { service } => Some(service),
            Command::LogsStop { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    UnknownCommand(String),
    MissingService(&'static str),
    UnexpectedField {
        command: &'static str,
        field: &'static str,
    },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::UnknownCommand(command) => write!(f, "unknown command '{command}'"),
            CommandError::MissingService(command) => {
                write!(f, "command '{command}' requires a service")
            }
            CommandError::UnexpectedField { command, field } => {
                write!(f, "command '{command}' does not accept field '{field}'")
            }
        }
    }
}

impl std::error::Error for CommandError {}

impl TryFrom<Request> for Command {
    type Error = CommandError;

    fn try_from(req: Request) -> Result<Self, Self::Error> {
        let Request {
            command,
            service,
            stream_id,
        } = req;

        match command.as_str() {
            "status" => {
                if stream_id.is_some() {
                    return Err(CommandError::UnexpectedField {
                        command: "status",
                        field: "stream_id",
                    });
                }
                Ok(Command::Status {
                    service: service.filter(|s| !s.trim().is_empty()),
                })
            }
            "start" => Ok(Command::Start {
                service: require_service("start", service, &stream_id)?,
            }),
            "stop" => Ok(Command::Stop {
                service: require_service("stop", service, &stream_id)?,
            }),
            "restart" => Ok(Command::Restart {
                service: require_service("restart", service, &stream_id)?,
            }),
            "enable" => Ok(Command::Enable {
                service: require_service("enable", service, &stream_id)?,
            }),
            "disable" => Ok(Command::Disable {
                service: require_service("disable", service, &stream_id)?,
            }),
            "logs_stream" => Ok(Command::LogsStream {
                service: require_service("logs_stream", service, &stream_id)?,
            }),
            "logs_stop" => {
                if service.is_some() {
                    return Err(CommandError::UnexpectedField {
                        command: "logs_stop",
                        field: "service",
                    });
                }
                Ok(Command::LogsStop { stream_id })
            }
            _ => Err(CommandError::UnknownCommand(command)),
        }
    }
}

fn require_service(
    command: &'static str,
    service: Option<String>,
    stream_id: &Option<StreamId>,
) -> Result<String, CommandError> {
    if stream_id.is_some() {
        return Err(CommandError::UnexpectedField {
            command,
            field: "stream_id",
        });
    }
    service
        .filter(|s| !s.trim().is_empty())
        .ok_or(CommandError::MissingService(command))
}

impl From<Command> for Request {
    fn from(command: Command) -> Self {
        let name = command.name().to_owned();
        match command {
            Command::LogsStop { stream_id } => Request {
                command: name,
                service: None,
                stream_id,
            },
            other => Request {
                command: name,
                service: other.service().map(str::to_owned),
                stream_id: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Ok,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidCommand,
    UnknownService,
    NotFound,
    ServiceFailed,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCommand => "invalid_command",
            ErrorCode::UnknownService => "unknown_service",
            ErrorCode::NotFound => "not_found",
            ErrorCode::ServiceFailed => "service_failed",
            ErrorCode::Timeout => "timeout",
            ErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response to a simple (non-streaming) command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub result: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn ok(service: impl Into<String>, status: ServiceStatus) -> Self {
        Reply {
            result: Outcome::Ok,
            service: Some(service.into()),
            status: Some(status),
            services: None,
            error: None,
            message: None,
        }
    }

    pub fn agent(services: Vec<ServiceStatus>) -> Self {
        Reply {
            result: Outcome::Ok,
            service: None,
            status: None,
            services: Some(services),
            error: None,
            message: Some("agent is running".to_owned()),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Reply {
            result: Outcome::Error,
            service: None,
            status: None,
            services: None,
            error: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn with_service(mut self, service: Option<impl Into<String>>) -> Self {
        self.service = service.map(Into::into);
        self
    }

    pub fn with_status(mut self, status: Option<ServiceStatus>) -> Self {
        self.status = status;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.result == Outcome::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Stopped,
    ProcessExited,
    AlreadyStopped,
    NoActiveStreams,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    LogsStreamStarted {
        stream_id: StreamId,
        service: String,
    },
    LogsData {
        stream_id: StreamId,
        data: serde_json::Value,
    },
    LogsStreamEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<StreamId>,
        reason: EndReason,
    },
}

/// Anything the agent writes back on a control connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Event(StreamEvent),
    Reply(Reply),
}

impl From<Reply> for Frame {
    fn from(reply: Reply) -> Self {
        Frame::Reply(reply)
    }
}

impl From<StreamEvent> for Frame {
    fn from(event: StreamEvent) -> Self {
        Frame::Event(event)
    }
}

#[derive(PartialEq, Eq, Hash, Clone, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId(String);

impl StreamId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({:?})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > 64 {
            return Err("StreamId must be 1 to 64 characters long");
        }
        if !s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
            return Err("StreamId may only contain [A-Za-z0-9_-]");
        }
        Ok(StreamId(s.to_owned()))
    }
}

impl TryFrom<String> for StreamId {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StreamId> for String {
    fn from(value: StreamId) -> Self {
        value.0
    }
}

#[cfg(feature = "rand")]
impl StreamId {
    pub fn random() -> Self {
        use rand::{Rng, distr::Alphanumeric};

        let id = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(STREAM_ID_LENGTH)
            .map(char::from)
            .collect();

        StreamId(id)
    }
}

/// `{"data": [...]}` envelope used by the backend list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub data: Option<Vec<T>>,
}

impl<T> Envelope<T> {
    pub fn into_items(self) -> Vec<T> {
        self.data.unwrap_or_default()
    }
}

/// One project as returned by `GET /api/projects`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRecord {
    #[serde(default, alias = "project_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default)]
    pub framework_type: Option<String>,
}

/// One worker as returned by `GET /api/workers`: either a bare unit name or an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerRecord {
    Name(String),
    Named {
        #[serde(alias = "service_name", alias = "service")]
        name: String,
    },
}

impl WorkerRecord {
    pub fn name(&self) -> &str {
        match self {
            WorkerRecord::Name(name) | WorkerRecord::Named { name } => name,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(line: &str) -> Result<Command, String> {
        let req: Request = serde_json::from_str(line).map_err(|e| e.to_string())?;
        Command::try_from(req).map_err(|e| e.to_string())
    }

    #[test]
    fn test_service_commands_require_service() {
        assert_eq!(
            parse(r#"{"command":"start","service":"nginx"}"#),
            Ok(Command::Start {
                service: "nginx".to_owned()
            })
        );
        assert!(parse(r#"{"command":"restart"}"#).is_err());
        assert!(parse(r#"{"command":"stop","service":"  "}"#).is_err());
    }

    #[test]
    fn test_rejects_fields_outside_schema() {
        assert!(parse(r#"{"command":"status","extra":1}"#).is_err());
        assert!(parse(r#"{"command":"start","service":"nginx","stream_id":"abc"}"#).is_err());
        assert!(parse(r#"{"command":"logs_stop","service":"nginx"}"#).is_err());
        assert!(parse(r#"{"command":"reboot"}"#).is_err());
        assert!(parse(r#"{"command":"logs_stop","stream_id":"../etc"}"#).is_err());
    }

    #[test]
    fn test_logs_stop_with_and_without_id() {
        assert_eq!(
            parse(r#"{"command":"logs_stop"}"#),
            Ok(Command::LogsStop { stream_id: None })
        );
        assert_eq!(
            parse(r#"{"command":"logs_stop","stream_id":"abc123"}"#),
            Ok(Command::LogsStop {
                stream_id: Some("abc123".parse().unwrap())
            })
        );
    }

    #[test]
    fn test_frames_are_distinguishable() {
        let event = Frame::from(StreamEvent::LogsStreamEnded {
            stream_id: None,
            reason: EndReason::ProcessExited,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"logs_stream_ended","reason":"process_exited"}"#);
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);

        let reply: Frame =
            serde_json::from_str(r#"{"result":"error","error":"unknown_service"}"#).unwrap();
        match reply {
            Frame::Reply(reply) => assert_eq!(reply.error, Some(ErrorCode::UnknownService)),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_worker_record_shapes() {
        let workers: Envelope<WorkerRecord> =
            serde_json::from_str(r#"{"data":["nginx",{"name":"queue-worker"},{"service":"cron"}]}"#)
                .unwrap();
        let names: Vec<_> = workers
            .into_items()
            .iter()
            .map(|w| w.name().to_owned())
            .collect();
        assert_eq!(names, ["nginx", "queue-worker", "cron"]);

        let empty: Envelope<WorkerRecord> = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(empty.into_items().is_empty());
        let missing: Envelope<WorkerRecord> = serde_json::from_str("{}").unwrap();
        assert!(missing.into_items().is_empty());
    }

    #[cfg(feature = "rand")]
    #[test]
    fn test_random_stream_id() {
        let a = StreamId::random();
        let b = StreamId::random();
        assert_eq!(a.as_str().len(), STREAM_ID_LENGTH);
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<StreamId>(), Ok(a));
    }
}
