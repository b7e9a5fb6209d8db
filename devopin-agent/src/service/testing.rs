//! In-memory [`ServiceManager`] for tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
    time::Duration,
};

use time::OffsetDateTime;
use tokio::time::Instant;

use super::{ServiceAction, ServiceError, ServiceManager, UnitProbe};

#[derive(Debug, Clone)]
struct FakeUnit {
    active: bool,
    enabled: bool,
    since: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub action: ServiceAction,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
pub struct FakeManager {
    units: Mutex<HashMap<String, FakeUnit>>,
    failing_starts: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    action_delay: Duration,
    follow_script: Option<String>,
}

impl FakeManager {
    /// Units as `(name, active, enabled)`.
    pub fn with_units<'a>(units: impl IntoIterator<Item = (&'a str, bool, bool)>) -> Self {
        let units = units
            .into_iter()
            .map(|(name, active, enabled)| {
                (
                    name.to_owned(),
                    FakeUnit {
                        active,
                        enabled,
                        since: active.then(OffsetDateTime::now_utc),
                    },
                )
            })
            .collect();
        FakeManager {
            units: Mutex::new(units),
            ..Default::default()
        }
    }

    pub fn with_action_delay(mut self, delay: Duration) -> Self {
        self.action_delay = delay;
        self
    }

    /// Shell script run by [`ServiceManager::follow_command`]; `$1` is the unit name.
    pub fn with_follow_script(mut self, script: impl Into<String>) -> Self {
        self.follow_script = Some(script.into());
        self
    }

    pub fn fail_start(&self, name: &str) {
        self.failing_starts.lock().unwrap().insert(name.to_owned());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

impl ServiceManager for FakeManager {
    async fn probe(&self, name: &str) -> Result<UnitProbe, ServiceError> {
        let units = self.units.lock().unwrap();
        Ok(match units.get(name) {
            Some(unit) => UnitProbe {
                exists: true,
                active_state: if unit.active { "active" } else { "inactive" }.to_owned(),
                sub_state: if unit.active { "running" } else { "dead" }.to_owned(),
                enabled: unit.enabled,
                active_since: unit.since,
            },
            None => UnitProbe::default(),
        })
    }

    async fn apply(&self, name: &str, action: ServiceAction) -> Result<(), ServiceError> {
        let started = Instant::now();
        tokio::time::sleep(self.action_delay).await;

        let failed = action == ServiceAction::Start
            && self.failing_starts.lock().unwrap().contains(name);
        if !failed {
            let mut units = self.units.lock().unwrap();
            if let Some(unit) = units.get_mut(name) {
                match action {
                    ServiceAction::Start | ServiceAction::Restart => {
                        unit.active = true;
                        unit.since = Some(OffsetDateTime::now_utc());
                    }
                    ServiceAction::Stop => {
                        unit.active = false;
                        unit.since = None;
                    }
                    ServiceAction::Enable => unit.enabled = true,
                    ServiceAction::Disable => unit.enabled = false,
                }
            }
        }

        self.calls.lock().unwrap().push(Call {
            name: name.to_owned(),
            action,
            started,
            finished: Instant::now(),
        });
        if failed {
            return Err(ServiceError::ActionFailed {
                service: name.to_owned(),
                action,
                message: format!("Job for {name}.service failed"),
                status: None,
            });
        }
        Ok(())
    }

    fn follow_command(&self, name: &str, _backlog: usize) -> tokio::process::Command {
        let script = self
            .follow_script
            .as_deref()
            .unwrap_or("while :; do echo \"$1 alive\"; sleep 0.1; done");
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(script).arg("follow").arg(name);
        cmd
    }
}
