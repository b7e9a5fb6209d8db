use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod msg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
    Unknown,
}

impl LogLevel {
    /// Maps the level label of any supported framework onto the shared scale.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" | "VERBOSE" | "SILLY" => Self::Debug,
            "INFO" | "NOTICE" | "LOG" | "HTTP" => Self::Info,
            "WARN" | "WARNING" => Self::Warn,
            "ERROR" | "ERR" => Self::Error,
            "CRITICAL" | "CRIT" | "FATAL" | "ALERT" | "EMERGENCY" | "EMERG" => Self::Critical,
            _ => Self::Unknown,
        }
    }

    /// syslog / journald `PRIORITY` field.
    pub fn from_syslog_priority(priority: u8) -> Self {
        match priority {
            0..=2 => Self::Critical,
            3 => Self::Error,
            4 => Self::Warn,
            5 | 6 => Self::Info,
            7 => Self::Debug,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
            LogLevel::Unknown => "UNKNOWN",
        };
        f.write_str(label)
    }
}

/// Log format family a source is parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameworkKind {
    Laravel,
    #[serde(alias = "django", alias = "flask")]
    DjangoFlask,
    #[serde(alias = "node", alias = "node.js", alias = "express")]
    Nodejs,
    Python,
    #[serde(alias = "uvicorn")]
    Fastapi,
}

impl FrameworkKind {
    pub const ALL: [FrameworkKind; 5] = [
        FrameworkKind::Laravel,
        FrameworkKind::DjangoFlask,
        FrameworkKind::Nodejs,
        FrameworkKind::Python,
        FrameworkKind::Fastapi,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameworkKind::Laravel => "laravel",
            FrameworkKind::DjangoFlask => "django_flask",
            FrameworkKind::Nodejs => "nodejs",
            FrameworkKind::Python => "python",
            FrameworkKind::Fastapi => "fastapi",
        }
    }
}

impl fmt::Display for FrameworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FrameworkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "laravel" => Ok(FrameworkKind::Laravel),
            "django_flask" | "django" | "flask" => Ok(FrameworkKind::DjangoFlask),
            "nodejs" | "node" | "node.js" | "express" => Ok(FrameworkKind::Nodejs),
            "python" => Ok(FrameworkKind::Python),
            "fastapi" | "uvicorn" => Ok(FrameworkKind::Fastapi),
            other => Err(format!("unsupported framework kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub level: LogLevel,
    pub message: String,
    pub context: Option<String>,
    pub controller: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub raw_line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub default_interface: Option<InterfaceIo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceIo {
    pub name: String,
    pub rx_bytes: Option<u64>,
    pub tx_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetricsSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub memory_available: u64,
    pub memory_total: u64,
    pub disk_usage: BTreeMap<String, DiskUsage>,
    pub network_io: NetworkIo,
    pub load_average: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub name: String,
    pub active: bool,
    pub enabled: bool,
    #[serde(rename = "status")]
    pub status_text: String,
    /// Seconds since the unit entered the active state.
    pub uptime: Option<u64>,
    #[serde(with = "rfc3339_or_compact")]
    pub since: Option<OffsetDateTime>,
}

/// RFC 3339 text on JSON, `time`'s compact tuple on postcard.
mod rfc3339_or_compact {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(
        value: &Option<OffsetDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            time::serde::rfc3339::option::serialize(value, serializer)
        } else {
            value.serialize(serializer)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<OffsetDateTime>, D::Error> {
        if deserializer.is_human_readable() {
            time::serde::rfc3339::option::deserialize(deserializer)
        } else {
            Option::<OffsetDateTime>::deserialize(deserializer)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub host_name: Option<String>,
    pub system_name: Option<String>,
    pub kernel_version: Option<String>,
    pub os_version: Option<String>,
    pub cpu_arch: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPayload {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub host: HostInfo,
    pub logs: BTreeMap<String, Vec<LogEntry>>,
    pub system_metrics: SystemMetricsSnapshot,
    pub services: Vec<ServiceStatus>,
    /// Per-source and per-service failures of the cycle that produced this payload.
    pub errors: Vec<String>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_payload() -> MonitoringPayload {
        let ts = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let entry = LogEntry {
            source_id: "shop".to_owned(),
            timestamp: ts,
            level: LogLevel::Error,
            message: "boom".to_owned(),
            context: Some("{\"user\":1}".to_owned()),
            controller: None,
            file_path: None,
            line_number: Some(12),
            raw_line: "[2023-11-14 22:13:20] production.ERROR: boom {\"user\":1}".to_owned(),
        };
        MonitoringPayload {
            timestamp: ts,
            host: HostInfo::default(),
            logs: BTreeMap::from([("shop".to_owned(), vec![entry])]),
            system_metrics: SystemMetricsSnapshot {
                timestamp: ts,
                cpu_percent: 12.5,
                memory_percent: 40.0,
                memory_available: 1024,
                memory_total: 4096,
                disk_usage: BTreeMap::from([(
                    "/".to_owned(),
                    DiskUsage {
                        total: 100,
                        used: 25,
                        free: 75,
                        percent: 25.0,
                    },
                )]),
                network_io: NetworkIo::default(),
                load_average: [0.5, 0.25, 0.125],
            },
            services: vec![ServiceStatus {
                name: "nginx".to_owned(),
                active: true,
                enabled: true,
                status_text: "active (running)".to_owned(),
                uptime: Some(30),
                since: Some(ts),
            }],
            errors: vec![],
        }
    }

    #[test]
    fn test_payload_survives_postcard() {
        // the spool stores payloads as postcard records
        let payload = sample_payload();
        let bytes = postcard::to_allocvec(&payload).expect("encode");
        let decoded: MonitoringPayload = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_active_service_survives_postcard() {
        let status = sample_payload().services.remove(0);
        assert!(status.since.is_some());
        let bytes = postcard::to_allocvec(&status).expect("encode");
        let decoded: ServiceStatus = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, status);

        let stopped = ServiceStatus {
            since: None,
            uptime: None,
            ..status
        };
        let bytes = postcard::to_allocvec(&stopped).expect("encode");
        let decoded: ServiceStatus = postcard::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded, stopped);
    }

    #[test]
    fn test_service_status_since_from_json() {
        let status: ServiceStatus = serde_json::from_str(
            r#"{"name":"nginx","active":true,"enabled":true,"status":"active (running)","uptime":30,"since":"2023-11-14T22:13:20Z"}"#,
        )
        .unwrap();
        assert_eq!(status, sample_payload().services[0]);

        let status: ServiceStatus = serde_json::from_str(
            r#"{"name":"nginx","active":false,"enabled":true,"status":"inactive (dead)","uptime":null,"since":null}"#,
        )
        .unwrap();
        assert_eq!(status.since, None);
    }

    #[test]
    fn test_service_status_json_shape() {
        let status = &sample_payload().services[0];
        let json = serde_json::to_value(status).unwrap();
        assert_eq!(json["name"], "nginx");
        assert_eq!(json["active"], true);
        assert_eq!(json["status"], "active (running)");
        assert_eq!(json["since"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_framework_aliases() {
        let kind: FrameworkKind = serde_json::from_str("\"flask\"").unwrap();
        assert_eq!(kind, FrameworkKind::DjangoFlask);
        assert_eq!("Node.js".parse::<FrameworkKind>(), Ok(FrameworkKind::Nodejs));
        assert!("cobol".parse::<FrameworkKind>().is_err());
        for label in ["fastapi", "uvicorn"] {
            let kind: FrameworkKind = serde_json::from_str(&format!("\"{label}\"")).unwrap();
            assert_eq!(kind, FrameworkKind::Fastapi);
            assert_eq!(label.parse::<FrameworkKind>(), Ok(kind));
        }
        assert_eq!(
            serde_json::to_string(&FrameworkKind::DjangoFlask).unwrap(),
            "\"django_flask\""
        );
    }

    #[test]
    fn test_level_labels() {
        assert_eq!(LogLevel::from_label("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_label("FATAL"), LogLevel::Critical);
        assert_eq!(LogLevel::from_label("weird"), LogLevel::Unknown);
        assert_eq!(LogLevel::from_syslog_priority(3), LogLevel::Error);
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"WARN\"");
    }
}
