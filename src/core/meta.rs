//! Structured results of one sandboxed execution.
//!
//! The records round-trip through the line based `key: value` meta file
//! format written into every pass directory, so a stored run can be
//! re-examined later without re-executing anything.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use itertools::Itertools;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetaParseError {
    #[error("malformed meta line `{0}`")]
    MalformedLine(String),
    #[error("unknown meta key `{0}`")]
    UnknownKey(String),
    #[error("meta key `{0}` occurs more than once")]
    DuplicateKey(String),
    #[error("meta key `{0}` is missing")]
    MissingKey(&'static str),
    #[error("invalid value `{value}` for meta key `{key}`")]
    InvalidValue { key: String, value: String },
}

/// Whether a time limit was hit, and how badly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeResult {
    #[default]
    Pass,
    Soft,
    Hard,
}

impl TimeResult {
    pub fn is_timelimit(self) -> bool {
        self != TimeResult::Pass
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeResult::Pass => "",
            TimeResult::Soft => "soft-timelimit",
            TimeResult::Hard => "hard-timelimit",
        }
    }
}

impl FromStr for TimeResult {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "pass" => Ok(TimeResult::Pass),
            "soft-timelimit" | "timelimit (soft)" => Ok(TimeResult::Soft),
            "hard-timelimit" | "timelimit (hard)" | "timelimit" => Ok(TimeResult::Hard),
            _ => Err(()),
        }
    }
}

/// The clock a [`TimeResult`] refers to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TimeUsed {
    #[default]
    Cpu,
    Wall,
}

impl TimeUsed {
    pub fn as_str(self) -> &'static str {
        match self {
            TimeUsed::Cpu => "cpu-time",
            TimeUsed::Wall => "wall-time",
        }
    }
}

impl FromStr for TimeUsed {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu-time" => Ok(TimeUsed::Cpu),
            "wall-time" => Ok(TimeUsed::Wall),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct OutputTruncated {
    pub stdout: bool,
    pub stderr: bool,
}

impl fmt::Display for OutputTruncated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let streams = [(self.stdout, "stdout"), (self.stderr, "stderr")];
        let list = streams
            .iter()
            .filter(|(truncated, _)| *truncated)
            .map(|(_, name)| name)
            .join(",");
        f.write_str(&list)
    }
}

impl FromStr for OutputTruncated {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut truncated = OutputTruncated::default();
        for stream in s.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match stream {
                "stdout" => truncated.stdout = true,
                "stderr" => truncated.stderr = true,
                _ => return Err(()),
            }
        }
        Ok(truncated)
    }
}

/// Resource usage and outcome of a single process execution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionMetadata {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub time_used: TimeUsed,
    pub time_result: TimeResult,
    pub output_truncated: OutputTruncated,
    pub stdin_bytes: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// What the compare step (or interactive validator) reported.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompareMetadata {
    pub exit_code: i32,
    pub validator_exited_first: bool,
}

struct MetaLines<'a> {
    entries: Vec<(&'a str, &'a str)>,
}

impl<'a> MetaLines<'a> {
    fn parse(text: &'a str, known: &[&str]) -> Result<Self, MetaParseError> {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| MetaParseError::MalformedLine(line.to_string()))?;
            let key = key.trim();
            if !known.contains(&key) {
                return Err(MetaParseError::UnknownKey(key.to_string()));
            }
            if !seen.insert(key) {
                return Err(MetaParseError::DuplicateKey(key.to_string()));
            }
            entries.push((key, value.trim()));
        }
        Ok(MetaLines { entries })
    }

    fn raw(&self, key: &str) -> Option<&'a str> {
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| *value)
    }

    fn get<T: FromStr>(&self, key: &'static str) -> Result<Option<T>, MetaParseError> {
        self.raw(key)
            .map(|value| {
                value.parse().map_err(|_| MetaParseError::InvalidValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    fn require<T: FromStr>(&self, key: &'static str) -> Result<T, MetaParseError> {
        self.get(key)?.ok_or(MetaParseError::MissingKey(key))
    }

    fn seconds(&self, key: &'static str) -> Result<Duration, MetaParseError> {
        let secs: f64 = self.require(key)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(MetaParseError::InvalidValue {
                key: key.to_string(),
                value: secs.to_string(),
            });
        }
        // Meta files carry millisecond precision.
        Ok(Duration::from_millis((secs * 1000.0).round() as u64))
    }
}

fn invalid(key: &str, value: &str) -> MetaParseError {
    MetaParseError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

const EXECUTION_KEYS: &[&str] = &[
    "exitcode",
    "signal",
    "cpu-time",
    "wall-time",
    "memory-bytes",
    "time-used",
    "time-result",
    "output-truncated",
    "stdin-bytes",
    "stdout-bytes",
    "stderr-bytes",
];

impl FromStr for ExecutionMetadata {
    type Err = MetaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lines = MetaLines::parse(s, EXECUTION_KEYS)?;

        let time_result = match lines.raw("time-result") {
            Some(raw) => raw.parse().map_err(|_| invalid("time-result", raw))?,
            None => TimeResult::Pass,
        };
        let time_used = match lines.raw("time-used") {
            Some(raw) => raw.parse().map_err(|_| invalid("time-used", raw))?,
            None => TimeUsed::Cpu,
        };
        let output_truncated = match lines.raw("output-truncated") {
            Some(raw) => raw.parse().map_err(|_| invalid("output-truncated", raw))?,
            None => OutputTruncated::default(),
        };

        Ok(ExecutionMetadata {
            exit_code: lines.require("exitcode")?,
            signal: lines.get("signal")?,
            cpu_time: lines.seconds("cpu-time")?,
            wall_time: lines.seconds("wall-time")?,
            memory_bytes: lines.require("memory-bytes")?,
            time_used,
            time_result,
            output_truncated,
            stdin_bytes: lines.get("stdin-bytes")?.unwrap_or(0),
            stdout_bytes: lines.require("stdout-bytes")?,
            stderr_bytes: lines.require("stderr-bytes")?,
        })
    }
}

impl fmt::Display for ExecutionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "exitcode: {}", self.exit_code)?;
        if let Some(signal) = self.signal {
            writeln!(f, "signal: {}", signal)?;
        }
        writeln!(f, "wall-time: {:.3}", self.wall_time.as_secs_f64())?;
        writeln!(f, "cpu-time: {:.3}", self.cpu_time.as_secs_f64())?;
        writeln!(f, "memory-bytes: {}", self.memory_bytes)?;
        writeln!(f, "time-used: {}", self.time_used.as_str())?;
        writeln!(f, "time-result: {}", self.time_result.as_str())?;
        writeln!(f, "output-truncated: {}", self.output_truncated)?;
        writeln!(f, "stdin-bytes: {}", self.stdin_bytes)?;
        writeln!(f, "stdout-bytes: {}", self.stdout_bytes)?;
        writeln!(f, "stderr-bytes: {}", self.stderr_bytes)
    }
}

const COMPARE_KEYS: &[&str] = &["exitcode", "validator-exited-first"];

impl FromStr for CompareMetadata {
    type Err = MetaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lines = MetaLines::parse(s, COMPARE_KEYS)?;
        Ok(CompareMetadata {
            exit_code: lines.require("exitcode")?,
            validator_exited_first: lines.get("validator-exited-first")?.unwrap_or(false),
        })
    }
}

impl fmt::Display for CompareMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "exitcode: {}", self.exit_code)?;
        writeln!(f, "validator-exited-first: {}", self.validator_exited_first)
    }
}
