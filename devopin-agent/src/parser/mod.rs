//! Incremental log parsing.
//!
//! A [`LogSource`] is read from its last [`Cursor`] up to the last complete
//! line. Lines that do not start a new record are folded into the previous
//! record as continuation lines (stack traces, wrapped JSON, ...).

use std::{
    fs::File,
    io::{self, BufRead, BufReader, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use devopin_proto::{FrameworkKind, LogEntry};
use log::{debug, trace};
use time::OffsetDateTime;

use crate::{catalog::ProjectSource, ledger::Cursor};

pub mod formats;

use formats::{LineParser, ParsedLine, extract_location, parser_for};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("log file {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("log file {} is {size} bytes, over the {limit} byte limit", .path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },
    #[error("unable to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ParseError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            ParseError::NotFound(path.to_owned())
        } else {
            ParseError::Io {
                path: path.to_owned(),
                source,
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseLimits {
    pub max_file_size: u64,
    pub max_line_length: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        ParseLimits {
            max_file_size: 50 * 1024 * 1024,
            max_line_length: 64 * 1024,
        }
    }
}

/// One log file bound to a parser.
#[derive(Debug, Clone)]
pub struct LogSource {
    pub source_id: String,
    pub file_path: PathBuf,
    pub framework: FrameworkKind,
    pub last_cursor: Option<Cursor>,
}

#[derive(Debug)]
pub struct ParseOutcome {
    pub entries: Vec<LogEntry>,
    /// Where the next read should start; only valid once the entries are delivered.
    pub cursor: Cursor,
    /// The previous cursor belonged to a rotated or truncated file.
    pub rotated: bool,
    pub skipped_lines: usize,
}

/// Expands a project into its log sources.
///
/// A file path yields one source named after the project; a directory yields
/// one source per `*.log` file, named `<project>/<file name>`.
pub fn discover_sources(project: &ProjectSource, base_dir: &Path) -> Result<Vec<LogSource>, ParseError> {
    let path = if project.log_path.is_absolute() {
        project.log_path.clone()
    } else {
        base_dir.join(&project.log_path)
    };
    let meta = std::fs::metadata(&path).map_err(|e| ParseError::io(&path, e))?;
    if !meta.is_dir() {
        return Ok(vec![LogSource {
            source_id: project.name.clone(),
            file_path: path,
            framework: project.framework,
            last_cursor: None,
        }]);
    }

    let mut files = std::fs::read_dir(&path)
        .map_err(|e| ParseError::io(&path, e))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "log"))
        .collect::<Vec<_>>();
    files.sort();

    Ok(files
        .into_iter()
        .map(|file| {
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            LogSource {
                source_id: format!("{}/{file_name}", project.name),
                file_path: file,
                framework: project.framework,
                last_cursor: None,
            }
        })
        .collect())
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}

/// Reads everything appended to `source` since its cursor.
///
/// Only newline-terminated lines are consumed; a trailing partial line is left
/// for the next call. A file that was rotated or truncated is read from the start.
pub fn parse_new_entries(source: &LogSource, limits: &ParseLimits) -> Result<ParseOutcome, ParseError> {
    let path = source.file_path.as_path();
    let mut file = File::open(path).map_err(|e| ParseError::io(path, e))?;
    let meta = file.metadata().map_err(|e| ParseError::io(path, e))?;
    let len = meta.len();
    if len > limits.max_file_size {
        return Err(ParseError::FileTooLarge {
            path: path.to_owned(),
            size: len,
            limit: limits.max_file_size,
        });
    }

    let inode = file_identity(&meta);
    let (start, rotated) = match source.last_cursor {
        Some(cursor) if cursor.inode == inode && cursor.offset <= len => (cursor.offset, false),
        Some(cursor) => {
            debug!(
                "{} was rotated or truncated (offset {} > {len} or new inode), reading from the start",
                source.source_id, cursor.offset
            );
            (0, true)
        }
        None => (0, false),
    };
    file.seek(SeekFrom::Start(start))
        .map_err(|e| ParseError::io(path, e))?;

    let mut reader = BufReader::new(file.take(len - start));
    let mut assembler = RecordAssembler::new(&source.source_id, parser_for(source.framework));
    let mut offset = start;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| ParseError::io(path, e))?;
        if n == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        offset += n as u64;

        if buf.len() > limits.max_line_length {
            trace!("{}: skipping {} byte line", source.source_id, buf.len());
            assembler.skip();
            continue;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        assembler.push(line);
    }

    let (entries, skipped_lines) = assembler.finish();
    let last_timestamp = entries
        .last()
        .map(|entry| entry.timestamp)
        .or(source.last_cursor.and_then(|c| c.last_timestamp));
    Ok(ParseOutcome {
        entries,
        cursor: Cursor {
            offset,
            inode,
            last_timestamp,
        },
        rotated,
        skipped_lines,
    })
}

struct RecordAssembler<'a> {
    source_id: &'a str,
    parser: LineParser,
    pending: Option<LogEntry>,
    entries: Vec<LogEntry>,
    skipped: usize,
}

impl<'a> RecordAssembler<'a> {
    fn new(source_id: &'a str, parser: LineParser) -> Self {
        RecordAssembler {
            source_id,
            parser,
            pending: None,
            entries: Vec::new(),
            skipped: 0,
        }
    }

    fn push(&mut self, line: &str) {
        match (self.parser)(line) {
            Some(parsed) => {
                self.flush_pending();
                self.pending = Some(self.entry(parsed, line));
            }
            None => match self.pending.as_mut() {
                Some(entry) => {
                    entry.message.push('\n');
                    entry.message.push_str(line);
                    entry.raw_line.push('\n');
                    entry.raw_line.push_str(line);
                }
                None => self.skipped += 1,
            },
        }
    }

    /// An oversized line ends the current record.
    fn skip(&mut self) {
        self.flush_pending();
        self.skipped += 1;
    }

    fn entry(&self, parsed: ParsedLine, line: &str) -> LogEntry {
        LogEntry {
            source_id: self.source_id.to_owned(),
            timestamp: parsed.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            level: parsed.level,
            message: parsed.message,
            context: parsed.context,
            controller: parsed.controller,
            file_path: parsed.file_path,
            line_number: parsed.line_number,
            raw_line: line.to_owned(),
        }
    }

    fn flush_pending(&mut self) {
        let Some(mut entry) = self.pending.take() else {
            return;
        };
        if let Some(location) = extract_location(&entry.message) {
            entry.controller = entry.controller.or(location.controller);
            entry.file_path = entry.file_path.or(location.file_path);
            entry.line_number = entry.line_number.or(location.line_number);
        }
        self.entries.push(entry);
    }

    fn finish(mut self) -> (Vec<LogEntry>, usize) {
        self.flush_pending();
        (self.entries, self.skipped)
    }
}

#[cfg(test)]
mod test {
    use std::{fs, io::Write};

    use devopin_proto::LogLevel;

    use super::*;

    const LARAVEL_LOG: &str = "\
[2024-01-15 10:30:45] production.ERROR: Database connection failed {\"exception\":\"PDOException\"}
[2024-01-15 10:31:02] production.WARNING: Cache miss for key user:42
[2024-01-15 10:32:10] production.INFO: Order 1001 shipped
";

    fn source(path: &Path, cursor: Option<Cursor>) -> LogSource {
        LogSource {
            source_id: "shop".to_owned(),
            file_path: path.to_owned(),
            framework: FrameworkKind::Laravel,
            last_cursor: cursor,
        }
    }

    fn append(path: &Path, text: &str) {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_cold_start_reads_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laravel.log");
        fs::write(&path, LARAVEL_LOG).unwrap();

        let outcome = parse_new_entries(&source(&path, None), &ParseLimits::default()).unwrap();
        let levels: Vec<_> = outcome.entries.iter().map(|e| e.level).collect();
        assert_eq!(levels, [LogLevel::Error, LogLevel::Warn, LogLevel::Info]);
        assert_eq!(outcome.entries[0].message, "Database connection failed");
        assert_eq!(outcome.cursor.offset, LARAVEL_LOG.len() as u64);
        assert_eq!(
            outcome.cursor.last_timestamp,
            Some(time::macros::datetime!(2024-01-15 10:32:10 UTC))
        );
    }

    #[test]
    fn test_rerun_without_appends_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laravel.log");
        fs::write(&path, LARAVEL_LOG).unwrap();

        let limits = ParseLimits::default();
        let first = parse_new_entries(&source(&path, None), &limits).unwrap();
        let second = parse_new_entries(&source(&path, Some(first.cursor)), &limits).unwrap();
        assert!(second.entries.is_empty());
        assert_eq!(second.cursor, first.cursor);
    }

    #[test]
    fn test_appends_across_cycles_match_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let limits = ParseLimits::default();

        let whole = dir.path().join("whole.log");
        fs::write(&whole, LARAVEL_LOG).unwrap();
        let expected = parse_new_entries(&source(&whole, None), &limits).unwrap();

        // the second chunk ends in the middle of a line
        let split_at = [0, 70, 150, LARAVEL_LOG.len()];
        let chunked = dir.path().join("chunked.log");
        let mut cursor = None;
        let mut entries = Vec::new();
        for window in split_at.windows(2) {
            append(&chunked, &LARAVEL_LOG[window[0]..window[1]]);
            let outcome = parse_new_entries(&source(&chunked, cursor), &limits).unwrap();
            entries.extend(outcome.entries);
            cursor = Some(outcome.cursor);
        }

        let strip = |e: &LogEntry| (e.timestamp, e.level, e.message.clone(), e.raw_line.clone());
        assert_eq!(
            entries.iter().map(strip).collect::<Vec<_>>(),
            expected.entries.iter().map(strip).collect::<Vec<_>>()
        );
        assert_eq!(cursor.unwrap().offset, expected.cursor.offset);
    }

    #[test]
    fn test_partial_line_is_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laravel.log");
        fs::write(&path, "[2024-01-15 10:30:45] production.INFO: half").unwrap();

        let outcome = parse_new_entries(&source(&path, None), &ParseLimits::default()).unwrap();
        assert!(outcome.entries.is_empty());
        assert_eq!(outcome.cursor.offset, 0);
    }

    #[test]
    fn test_continuation_lines_join_previous_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laravel.log");
        fs::write(
            &path,
            "stray line before any record\n\
             [2024-01-15 10:30:45] production.ERROR: Call to undefined method\n\
             #0 at /var/www/app/Http/Controllers/UserController.php:87\n\
             #1 {main}\n\
             [2024-01-15 10:30:46] production.INFO: recovered\n",
        )
        .unwrap();

        let outcome = parse_new_entries(&source(&path, None), &ParseLimits::default()).unwrap();
        assert_eq!(outcome.entries.len(), 2);
        assert_eq!(outcome.skipped_lines, 1);

        let error = &outcome.entries[0];
        assert!(error.message.ends_with("#1 {main}"));
        assert_eq!(error.raw_line.lines().count(), 3);
        assert_eq!(error.controller.as_deref(), Some("UserController"));
        assert_eq!(error.line_number, Some(87));
    }

    #[test]
    fn test_truncated_file_is_read_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laravel.log");
        fs::write(&path, LARAVEL_LOG).unwrap();
        let limits = ParseLimits::default();
        let first = parse_new_entries(&source(&path, None), &limits).unwrap();

        fs::write(&path, "[2024-01-16 00:00:01] production.INFO: fresh\n").unwrap();
        let outcome = parse_new_entries(&source(&path, Some(first.cursor)), &limits).unwrap();
        assert!(!first.rotated);
        assert!(outcome.rotated);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].message, "fresh");

        let again = parse_new_entries(&source(&path, Some(outcome.cursor)), &limits).unwrap();
        assert!(!again.rotated);
        assert!(again.entries.is_empty());
    }

    #[test]
    fn test_oversized_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("laravel.log");
        let long = format!("[2024-01-15 10:30:45] production.INFO: {}\n", "x".repeat(200));
        fs::write(&path, format!("{long}[2024-01-15 10:30:46] production.INFO: ok\n")).unwrap();

        let outcome = parse_new_entries(
            &source(&path, None),
            &ParseLimits {
                max_file_size: 1024,
                max_line_length: 128,
            },
        )
        .unwrap();
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.skipped_lines, 1);

        let err = parse_new_entries(
            &source(&path, None),
            &ParseLimits {
                max_file_size: 16,
                max_line_length: 128,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ParseError::FileTooLarge { .. }));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_new_entries(&source(&dir.path().join("gone.log"), None), &ParseLimits::default())
            .unwrap_err();
        assert!(matches!(err, ParseError::NotFound(_)));
    }

    #[test]
    fn test_directory_sources() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("api").join("logs");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("worker.log"), "").unwrap();
        fs::write(logs.join("app.log"), "").unwrap();
        fs::write(logs.join("notes.txt"), "").unwrap();

        let project = ProjectSource {
            name: "api".to_owned(),
            log_path: PathBuf::from("api/logs"),
            framework: FrameworkKind::Python,
        };
        let sources = discover_sources(&project, dir.path()).unwrap();
        let ids: Vec<_> = sources.iter().map(|s| s.source_id.as_str()).collect();
        assert_eq!(ids, ["api/app.log", "api/worker.log"]);
        assert!(sources.iter().all(|s| s.framework == FrameworkKind::Python));
    }
}
