use std::{fmt, future::Future, io, sync::LazyLock, time::Duration};

use devopin_proto::{ServiceStatus, msg::ErrorCode};
use log::{debug, info};
use regex::Regex;
use time::OffsetDateTime;

use crate::lock::KeyedLock;

pub mod systemctl;
#[cfg(test)]
pub mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl ServiceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Restart => "restart",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw unit state as reported by the service manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitProbe {
    pub exists: bool,
    pub active_state: String,
    pub sub_state: String,
    pub enabled: bool,
    pub active_since: Option<OffsetDateTime>,
}

impl UnitProbe {
    pub fn is_active(&self) -> bool {
        self.active_state == "active"
    }

    fn into_status(self, name: &str) -> ServiceStatus {
        let active = self.is_active();
        let since = self.active_since.filter(|_| active);
        let uptime = since.map(|since| {
            (OffsetDateTime::now_utc() - since)
                .whole_seconds()
                .max(0) as u64
        });
        let status_text = if self.sub_state.is_empty() {
            self.active_state
        } else {
            format!("{} ({})", self.active_state, self.sub_state)
        };
        ServiceStatus {
            name: name.to_owned(),
            active,
            enabled: self.enabled,
            status_text,
            uptime,
            since,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("service {0} not found")]
    NotFound(String),
    #[error("invalid service name {0:?}")]
    InvalidName(String),
    #[error("{action} {service} failed: {message}")]
    ActionFailed {
        service: String,
        action: ServiceAction,
        message: String,
        /// Re-queried state after the failed action, when it could be read.
        status: Option<Box<ServiceStatus>>,
    },
    #[error("unable to query {service}: {message}")]
    QueryFailed { service: String, message: String },
    #[error("service manager did not answer within {0:?}")]
    Timeout(Duration),
    #[error("unable to run service manager: {0}")]
    Spawn(#[from] io::Error),
}

impl ServiceError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::InvalidName(_) => ErrorCode::UnknownService,
            ServiceError::ActionFailed { .. } | ServiceError::QueryFailed { .. } => {
                ErrorCode::ServiceFailed
            }
            ServiceError::Timeout(_) => ErrorCode::Timeout,
            ServiceError::Spawn(_) => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> Option<&ServiceStatus> {
        match self {
            ServiceError::ActionFailed { status, .. } => status.as_deref(),
            _ => None,
        }
    }
}

/// Backend that knows how to inspect and drive units.
pub trait ServiceManager: Send + Sync + 'static {
    fn probe(&self, name: &str) -> impl Future<Output = Result<UnitProbe, ServiceError>> + Send;

    /// Issues a single verb. The result says nothing about the resulting state.
    fn apply(
        &self,
        name: &str,
        action: ServiceAction,
    ) -> impl Future<Output = Result<(), ServiceError>> + Send;

    /// Long-running command printing the unit's log, one record per line.
    fn follow_command(&self, name: &str, backlog: usize) -> tokio::process::Command;
}

static SERVICE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9@._:-]{1,128}$").unwrap_or_else(|e| panic!("service name pattern: {e}"))
});

pub fn is_valid_service_name(name: &str) -> bool {
    !name.starts_with('-') && SERVICE_NAME.is_match(name)
}

/// Status queries and serialized control actions on top of a [`ServiceManager`].
#[derive(Debug)]
pub struct ServiceMonitor<M> {
    manager: M,
    locks: KeyedLock,
    restart_delay: Duration,
}

impl<M: ServiceManager> ServiceMonitor<M> {
    pub fn new(manager: M, restart_delay: Duration) -> Self {
        Self {
            manager,
            locks: KeyedLock::new(),
            restart_delay,
        }
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub async fn status(&self, name: &str) -> Result<ServiceStatus, ServiceError> {
        if !is_valid_service_name(name) {
            return Err(ServiceError::InvalidName(name.to_owned()));
        }
        let probe = self.manager.probe(name).await?;
        if !probe.exists {
            return Err(ServiceError::NotFound(name.to_owned()));
        }
        Ok(probe.into_status(name))
    }

    /// Runs `action` and answers with the state observed afterwards.
    ///
    /// Actions on the same name are serialized; `Restart` is `Stop`, the
    /// configured delay, then `Start`.
    pub async fn control(
        &self,
        name: &str,
        action: ServiceAction,
    ) -> Result<ServiceStatus, ServiceError> {
        if !is_valid_service_name(name) {
            return Err(ServiceError::InvalidName(name.to_owned()));
        }
        let _guard = self.locks.own(name).await;

        if !self.manager.probe(name).await?.exists {
            return Err(ServiceError::NotFound(name.to_owned()));
        }

        info!("{action} {name}");
        let applied = match action {
            ServiceAction::Restart => {
                async {
                    self.manager.apply(name, ServiceAction::Stop).await?;
                    tokio::time::sleep(self.restart_delay).await;
                    self.manager.apply(name, ServiceAction::Start).await
                }
                .await
            }
            other => self.manager.apply(name, other).await,
        };

        let status = self.status(name).await;
        match applied {
            Ok(()) => {
                debug!("{action} {name} done");
                status
            }
            Err(e) => {
                let message = match e {
                    ServiceError::ActionFailed { message, .. } => message,
                    other => other.to_string(),
                };
                Err(ServiceError::ActionFailed {
                    service: name.to_owned(),
                    action,
                    message,
                    status: status.ok().map(Box::new),
                })
            }
        }
    }
}
