use std::{process::Stdio, time::Duration};

use log::trace;
use time::OffsetDateTime;
use tokio::process::Command;

use super::{ServiceAction, ServiceError, ServiceManager, UnitProbe};

const SHOW_PROPERTIES: &str =
    "--property=LoadState,ActiveState,SubState,UnitFileState,ActiveEnterTimestampMonotonic";

/// systemd backend driving `systemctl` and following `journalctl`.
#[derive(Debug, Clone)]
pub struct Systemctl {
    command_timeout: Duration,
}

impl Systemctl {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, ServiceError> {
        trace!("systemctl {}", args.join(" "));
        let mut cmd = Command::new("systemctl");
        cmd.args(args)
            .stdin(Stdio::null())
            .env("SYSTEMD_PAGER", "")
            .kill_on_drop(true);
        tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| ServiceError::Timeout(self.command_timeout))?
            .map_err(ServiceError::Spawn)
    }
}

impl ServiceManager for Systemctl {
    async fn probe(&self, name: &str) -> Result<UnitProbe, ServiceError> {
        let output = self.run(&["show", SHOW_PROPERTIES, "--", name]).await?;
        if !output.status.success() {
            return Err(ServiceError::QueryFailed {
                service: name.to_owned(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }
        let boot_time = sysinfo::System::boot_time();
        Ok(parse_show(&String::from_utf8_lossy(&output.stdout), boot_time))
    }

    async fn apply(&self, name: &str, action: ServiceAction) -> Result<(), ServiceError> {
        let output = self.run(&[action.as_str(), "--", name]).await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = match stderr.trim() {
            "" => format!("systemctl {action} exited with {}", output.status),
            text => text.to_owned(),
        };
        Err(ServiceError::ActionFailed {
            service: name.to_owned(),
            action,
            message,
            status: None,
        })
    }

    fn follow_command(&self, name: &str, backlog: usize) -> Command {
        let mut cmd = Command::new("journalctl");
        cmd.arg("--unit")
            .arg(name)
            .arg("--follow")
            .arg("--lines")
            .arg(backlog.to_string())
            .arg("--output=json")
            .arg("--no-pager");
        cmd
    }
}

/// Parses `systemctl show` key=value output. `boot_time` is in unix seconds.
fn parse_show(text: &str, boot_time: u64) -> UnitProbe {
    let mut probe = UnitProbe::default();
    let mut load_state = "";
    for (key, value) in text.lines().filter_map(|line| line.split_once('=')) {
        match key {
            "LoadState" => load_state = value,
            "ActiveState" => probe.active_state = value.to_owned(),
            "SubState" => probe.sub_state = value.to_owned(),
            "UnitFileState" => {
                probe.enabled = matches!(value, "enabled" | "enabled-runtime" | "alias")
            }
            "ActiveEnterTimestampMonotonic" => {
                // microseconds since boot, 0 when never activated
                probe.active_since = value
                    .parse::<u64>()
                    .ok()
                    .filter(|usec| *usec > 0 && boot_time > 0)
                    .and_then(|usec| {
                        let secs = boot_time.checked_add(usec / 1_000_000)?;
                        OffsetDateTime::from_unix_timestamp(i64::try_from(secs).ok()?).ok()
                    });
            }
            _ => {}
        }
    }
    probe.exists = !load_state.is_empty() && load_state != "not-found";
    probe
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_running_unit() {
        let probe = parse_show(
            "LoadState=loaded\nActiveState=active\nSubState=running\nUnitFileState=enabled\nActiveEnterTimestampMonotonic=5000000\n",
            1_700_000_000,
        );
        assert!(probe.exists);
        assert!(probe.is_active());
        assert!(probe.enabled);
        assert_eq!(probe.sub_state, "running");
        assert_eq!(
            probe.active_since,
            Some(OffsetDateTime::from_unix_timestamp(1_700_000_005).unwrap())
        );
    }

    #[test]
    fn test_parse_missing_unit() {
        let probe = parse_show(
            "LoadState=not-found\nActiveState=inactive\nSubState=dead\nUnitFileState=\nActiveEnterTimestampMonotonic=0\n",
            1_700_000_000,
        );
        assert!(!probe.exists);
        assert!(!probe.enabled);
        assert_eq!(probe.active_since, None);
    }

    #[test]
    fn test_follow_command_targets_unit() {
        let cmd = Systemctl::new(Duration::from_secs(1)).follow_command("nginx", 20);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(cmd.as_std().get_program(), "journalctl");
        assert_eq!(
            args,
            ["--unit", "nginx", "--follow", "--lines", "20", "--output=json", "--no-pager"]
        );
    }
}
