//! Per-framework line grammars.
//!
//! Every framework is one regular expression plus a small pure function that
//! turns the captures into a [`ParsedLine`]. Supporting a new framework means
//! adding one entry to [`PARSERS`].

use std::sync::LazyLock;

use devopin_proto::{FrameworkKind, LogLevel};
use regex::{Captures, Regex};
use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset,
    format_description::{BorrowedFormatItem, well_known::Rfc3339},
    macros::format_description,
};

/// Fields extracted from the first line of a log record.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub timestamp: Option<OffsetDateTime>,
    pub level: LogLevel,
    pub message: String,
    pub context: Option<String>,
    pub controller: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
}

pub type LineParser = fn(&str) -> Option<ParsedLine>;

pub static PARSERS: [(FrameworkKind, LineParser); 5] = [
    (FrameworkKind::Laravel, parse_laravel),
    (FrameworkKind::DjangoFlask, parse_django_flask),
    (FrameworkKind::Nodejs, parse_nodejs),
    (FrameworkKind::Python, parse_python),
    (FrameworkKind::Fastapi, parse_fastapi),
];

pub fn parser_for(kind: FrameworkKind) -> LineParser {
    PARSERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, parser)| *parser)
        .unwrap_or(parse_laravel)
}

const PY_LEVELS: &str = "DEBUG|INFO|WARNING|WARN|ERROR|CRITICAL|FATAL";
const ISO_TS: &str =
    r"\d{4}-\d{2}-\d{2}[ T]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?";

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern}: {e}"))
}

// [2024-01-15 10:30:45] production.ERROR: message {"context":1}
static LARAVEL: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"^\[(?P<ts>[^\]]+)\]\s+(?P<env>[\w-]+)\.(?P<level>[A-Za-z]+):\s?(?P<msg>.*?)(?:\s+(?P<ctx>\{.*\}|\[.*\]))?\s*$",
    )
});

// [2024-01-15 10:30:45,123] ERROR in app: message
// [2024-01-15 10:30:45,123] ERROR [django.request:241] message
// [15/Jan/2024 10:30:45] "GET / HTTP/1.1" 200 1234
static DJANGO_FLASK: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"^\[(?P<ts>[^\]]+)\]\s+(?:(?P<level>{PY_LEVELS})\s+)?(?:in\s+(?P<module>[\w.]+):\s+|\[(?P<logger>[\w.]+)(?::(?P<line>\d+))?\]\s+)?(?P<msg>.*)$"
    ))
});

// 2024-01-15T10:30:45.123Z error: message at handler (/app/src/api.js:42:13)
static NODEJS: LazyLock<Regex> = LazyLock::new(|| {
    compile(
        r"^(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2}))\s+(?:\[(?P<blevel>[A-Za-z]+)\]|(?P<level>[A-Za-z]+)):?\s+(?P<msg>.*?)(?:\s+at\s+(?P<controller>[\w.<>$]+)\s+\((?P<file>[^():]+):(?P<line>\d+):\d+\))?$",
    )
});

// 2024-01-15 10:30:45,123 ERROR message [billing.py:42]
// 2024-01-15 10:30:45,123 - worker - WARNING - message
static PYTHON: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"^(?P<ts>{ISO_TS})\s+(?:-\s+)?(?:(?P<logger>[\w.]+)\s+-\s+)?(?P<level>{PY_LEVELS})\s*(?:-\s+|:\s*)?(?P<msg>.*?)(?:\s+\[(?P<file>[^\]:]+):(?P<line>\d+)\])?$"
    ))
});

// INFO:     127.0.0.1:51234 - "GET /health HTTP/1.1" 200 OK
// 2024-01-15 10:30:45.123 | ERROR    | app.main:startup:42 - message
static FASTAPI: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"^(?:(?P<ts>{ISO_TS})\s*(?:\|\s*|-\s+)?)?(?P<level>{PY_LEVELS})(?::|\s*\|)\s+(?:(?P<loc>[\w.]+:[\w<>]+:\d+)\s+-\s+)?(?P<msg>.*)$"
    ))
});

fn text(caps: &Captures<'_>, name: &str) -> Option<String> {
    caps.name(name)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn number(caps: &Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

fn level(caps: &Captures<'_>, names: &[&str]) -> LogLevel {
    names
        .iter()
        .find_map(|name| caps.name(name))
        .map(|m| LogLevel::from_label(m.as_str()))
        .unwrap_or(LogLevel::Unknown)
}

pub fn parse_laravel(line: &str) -> Option<ParsedLine> {
    let caps = LARAVEL.captures(line.trim_end())?;
    Some(ParsedLine {
        timestamp: caps.name("ts").and_then(|m| parse_timestamp(m.as_str())),
        level: level(&caps, &["level"]),
        message: text(&caps, "msg").unwrap_or_default(),
        context: text(&caps, "ctx"),
        controller: None,
        file_path: None,
        line_number: None,
    })
}

pub fn parse_django_flask(line: &str) -> Option<ParsedLine> {
    let caps = DJANGO_FLASK.captures(line.trim_end())?;
    // the bracket must hold a timestamp, otherwise this is a continuation line
    let timestamp = parse_timestamp(caps.name("ts")?.as_str())?;
    Some(ParsedLine {
        timestamp: Some(timestamp),
        level: level(&caps, &["level"]),
        message: text(&caps, "msg").unwrap_or_default(),
        context: None,
        controller: text(&caps, "module").or_else(|| text(&caps, "logger")),
        file_path: None,
        line_number: number(&caps, "line"),
    })
}

pub fn parse_nodejs(line: &str) -> Option<ParsedLine> {
    let caps = NODEJS.captures(line.trim_end())?;
    Some(ParsedLine {
        timestamp: caps.name("ts").and_then(|m| parse_timestamp(m.as_str())),
        level: level(&caps, &["blevel", "level"]),
        message: text(&caps, "msg").unwrap_or_default(),
        context: None,
        controller: text(&caps, "controller"),
        file_path: text(&caps, "file"),
        line_number: number(&caps, "line"),
    })
}

pub fn parse_python(line: &str) -> Option<ParsedLine> {
    let caps = PYTHON.captures(line.trim_end())?;
    Some(ParsedLine {
        timestamp: caps.name("ts").and_then(|m| parse_timestamp(m.as_str())),
        level: level(&caps, &["level"]),
        message: text(&caps, "msg").unwrap_or_default(),
        context: None,
        controller: text(&caps, "logger"),
        file_path: text(&caps, "file"),
        line_number: number(&caps, "line"),
    })
}

pub fn parse_fastapi(line: &str) -> Option<ParsedLine> {
    let caps = FASTAPI.captures(line.trim_end())?;
    // loguru location: module:function:line
    let (file_path, controller, line_number) = match caps.name("loc") {
        Some(loc) => {
            let mut parts = loc.as_str().rsplitn(3, ':');
            let line = parts.next().and_then(|l| l.parse().ok());
            let function = parts.next().map(str::to_owned);
            let module = parts.next().map(str::to_owned);
            (module, function, line)
        }
        None => (None, None, None),
    };
    Some(ParsedLine {
        timestamp: caps.name("ts").and_then(|m| parse_timestamp(m.as_str())),
        level: level(&caps, &["level"]),
        message: text(&caps, "msg").unwrap_or_default(),
        context: None,
        controller,
        file_path,
        line_number,
    })
}

const NAIVE_FORMATS: [&[BorrowedFormatItem<'static>]; 5] = [
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second]"),
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]"),
    format_description!("[day]/[month repr:short]/[year] [hour]:[minute]:[second]"),
];

/// Parses the timestamp formats seen across the supported frameworks.
/// Timestamps without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(ts.to_offset(UtcOffset::UTC));
    }

    // python logging writes milliseconds after a comma
    let normalized = raw.replacen(',', ".", 1);
    if let Ok(ts) = OffsetDateTime::parse(&normalized, &Rfc3339) {
        return Some(ts.to_offset(UtcOffset::UTC));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|format| PrimitiveDateTime::parse(&normalized, format).ok())
        .map(PrimitiveDateTime::assume_utc)
}

/// Where in the application code a record points to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorLocation {
    pub controller: Option<String>,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
}

static LOCATION_PATTERNS: LazyLock<[Regex; 5]> = LazyLock::new(|| {
    [
        // at /var/www/app/Http/Controllers/UserController.php:87
        compile(r"at (?P<path>/\S+/)(?P<controller>\w+Controller)\.php:(?P<line>\d+)"),
        // UserController::store() ... at /path/file.php:123
        compile(r"(?P<controller>\w+Controller)::\w+\(.*?\).*?at (?P<file>/\S+?):(?P<line>\d+)"),
        // File "/app/views.py", line 10, in index
        compile(r#"File "(?P<file>[^"]+)", line (?P<line>\d+)(?:, in (?P<controller>[\w<>]+))?"#),
        // at handler (/app/src/api.js:42:13)
        compile(r"at (?P<controller>[\w.<>$]+) \((?P<file>[^:()]+):(?P<line>\d+)(?::\d+)?\)"),
        // at /app/src/api.js:42:13
        compile(r"at (?P<file>[^:\s()]+):(?P<line>\d+)(?::\d+)?"),
    ]
});

/// Scans a (possibly multi-line) message for a controller / file / line hint.
pub fn extract_location(message: &str) -> Option<ErrorLocation> {
    LOCATION_PATTERNS.iter().find_map(|pattern| {
        let caps = pattern.captures(message)?;
        let controller = text(&caps, "controller");
        let file_path = match (caps.name("path"), &controller) {
            (Some(path), Some(controller)) => Some(format!("{}{controller}.php", path.as_str())),
            _ => text(&caps, "file"),
        };
        Some(ErrorLocation {
            controller,
            file_path,
            line_number: number(&caps, "line"),
        })
    })
}
