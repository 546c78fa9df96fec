//! Attendance ledger: append-only per-identity check-in/check-out log.

use crate::types::Identity;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AttendanceKind {
    #[serde(rename = "Check-in")]
    CheckIn,
    #[serde(rename = "Check-out")]
    CheckOut,
}

impl AttendanceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceKind::CheckIn => "Check-in",
            AttendanceKind::CheckOut => "Check-out",
        }
    }
}

impl fmt::Display for AttendanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttendanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Check-in" => Ok(AttendanceKind::CheckIn),
            "Check-out" => Ok(AttendanceKind::CheckOut),
            other => Err(format!("unknown attendance kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEvent {
    pub identity: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub kind: AttendanceKind,
}

impl AttendanceEvent {
    fn to_line(&self) -> String {
        format!(
            "{},{},{}",
            self.date.format(DATE_FORMAT),
            self.time.format(TIME_FORMAT),
            self.kind
        )
    }

    fn parse_line(identity: &str, line: &str) -> Option<Self> {
        let mut fields = line.trim().splitn(3, ',');
        let date = NaiveDate::parse_from_str(fields.next()?, DATE_FORMAT).ok()?;
        let time = NaiveTime::parse_from_str(fields.next()?, TIME_FORMAT).ok()?;
        let kind = fields.next()?.parse().ok()?;
        Some(Self {
            identity: identity.to_string(),
            date,
            time,
            kind,
        })
    }
}

/// Why an attendance mark was turned down. Shown to the user as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceRejection {
    NotRecognized,
    AlreadyMarked(AttendanceKind),
    NoCheckIn,
}

impl fmt::Display for AttendanceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttendanceRejection::NotRecognized => f.write_str("face not recognized"),
            AttendanceRejection::AlreadyMarked(kind) => write!(f, "{kind} already marked"),
            AttendanceRejection::NoCheckIn => f.write_str("no check-in found"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marking {
    Recorded(AttendanceEvent),
    Rejected(AttendanceRejection),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Durable per-identity event log.
pub trait Ledger {
    /// All events for `identity` in append order; empty if none were ever recorded.
    fn history(&self, identity: &str) -> Result<Vec<AttendanceEvent>, LedgerError>;

    fn append(&self, event: &AttendanceEvent) -> Result<(), LedgerError>;
}

/// Record a check-in or check-out for `identity` at `now`.
///
/// `now` is taken once by the caller, so every check below compares against
/// the same calendar date. At most one event of each kind is kept per
/// identity per day, and a check-out needs that day's check-in.
pub fn mark_attendance(
    ledger: &dyn Ledger,
    identity: &Identity,
    kind: AttendanceKind,
    now: NaiveDateTime,
) -> Result<Marking, LedgerError> {
    let Some(name) = identity.as_known() else {
        return Ok(Marking::Rejected(AttendanceRejection::NotRecognized));
    };

    let date = now.date();
    let today: Vec<AttendanceEvent> = ledger
        .history(name)?
        .into_iter()
        .filter(|e| e.date == date)
        .collect();

    if today.iter().any(|e| e.kind == kind) {
        tracing::info!(identity = name, %kind, %date, "attendance rejected: already marked");
        return Ok(Marking::Rejected(AttendanceRejection::AlreadyMarked(kind)));
    }
    if kind == AttendanceKind::CheckOut && !today.iter().any(|e| e.kind == AttendanceKind::CheckIn) {
        tracing::info!(identity = name, %date, "attendance rejected: no check-in");
        return Ok(Marking::Rejected(AttendanceRejection::NoCheckIn));
    }

    let event = AttendanceEvent {
        identity: name.to_string(),
        date,
        time: now.time(),
        kind,
    };
    ledger.append(&event)?;

    tracing::info!(identity = name, %kind, %date, time = %event.time.format(TIME_FORMAT), "attendance recorded");
    Ok(Marking::Recorded(event))
}

/// Ledger stored as one `<identity>.csv` file per identity, one
/// `date,time,kind` line per event.
#[derive(Debug, Clone)]
pub struct CsvLedger {
    dir: PathBuf,
}

impl CsvLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn log_path(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{identity}.csv"))
    }

    fn io_err(path: &Path, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl Ledger for CsvLedger {
    fn history(&self, identity: &str) -> Result<Vec<AttendanceEvent>, LedgerError> {
        let path = self.log_path(identity);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&path, e)),
        };

        let mut events = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match AttendanceEvent::parse_line(identity, line) {
                Some(event) => events.push(event),
                None => {
                    tracing::warn!(path = %path.display(), line = lineno + 1, "malformed ledger line; skipping");
                }
            }
        }
        Ok(events)
    }

    fn append(&self, event: &AttendanceEvent) -> Result<(), LedgerError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;

        let path = self.log_path(&event.identity);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Self::io_err(&path, e))?;
        file.write_all(format!("{}\n", event.to_line()).as_bytes())
            .map_err(|e| Self::io_err(&path, e))
    }
}
