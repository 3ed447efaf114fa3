//! Scenario file loader.
//!
//! A scenario has two sections separated by one discarded line:
//!
//! ```text
//! 2
//! alice 9001
//! bob 9002
//!
//! 0 alice launch
//! 500 alice bid:10
//! ```
//!
//! The first section maps participants to ports, the second lists timed
//! events. Events are kept in file order; no sorting happens here.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::str::FromStr;

use crate::error::{DriverError, DriverResult};

/// Payload that makes the driver spawn a client instead of forwarding a line
pub const LAUNCH_MARKER: &str = "launch";

/// Participant name to port, as declared in the scenario header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortTable {
    ports: HashMap<String, String>,
}

impl PortTable {
    /// Insert a mapping; a repeated name replaces the earlier port
    pub fn insert(&mut self, participant: impl Into<String>, port: impl Into<String>) {
        self.ports.insert(participant.into(), port.into());
    }

    pub fn get(&self, participant: &str) -> Option<&str> {
        self.ports.get(participant).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.ports.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Distinct port values, sorted
    pub fn distinct_ports(&self) -> BTreeSet<&str> {
        self.ports.values().map(String::as_str).collect()
    }
}

/// What an event asks the driver to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Spawn the participant's client process
    Launch,
    /// Forward this line (without newline) to the participant's stdin
    Command(String),
}

impl Action {
    pub fn from_payload(payload: String) -> Self {
        if payload == LAUNCH_MARKER {
            Action::Launch
        } else {
            Action::Command(payload)
        }
    }

    pub fn is_launch(&self) -> bool {
        matches!(self, Action::Launch)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Launch => f.write_str(LAUNCH_MARKER),
            Action::Command(line) => f.write_str(line),
        }
    }
}

/// One timed line of the event section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Milliseconds since the start of the event loop
    pub timestamp_ms: u64,
    pub participant: String,
    pub action: Action,
}

/// A fully parsed scenario file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scenario {
    pub ports: PortTable,
    pub events: Vec<Event>,
}

impl Scenario {
    /// Read and parse a scenario file
    pub fn load(path: &Path) -> DriverResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Parse a scenario from any buffered reader
    pub fn from_reader<R: BufRead>(reader: R) -> DriverResult<Self> {
        let mut lines = reader.lines().enumerate();
        let mut next_line = move || -> DriverResult<Option<(usize, String)>> {
            match lines.next() {
                Some((idx, line)) => Ok(Some((idx + 1, line?))),
                None => Ok(None),
            }
        };

        let (count_no, count_line) =
            next_line()?.ok_or_else(|| DriverError::malformed(1, "missing participant count"))?;
        let count: usize = count_line.trim().parse().map_err(|_| {
            DriverError::malformed(
                count_no,
                format!("expected participant count, found '{}'", count_line.trim()),
            )
        })?;

        let mut ports = PortTable::default();
        for i in 0..count {
            let expected_no = count_no + i + 1;
            let (line_no, line) = next_line()?.ok_or_else(|| {
                DriverError::malformed(
                    expected_no,
                    format!("expected {} port lines, found {}", count, i),
                )
            })?;
            let mut tokens = line.split_whitespace();
            match (tokens.next(), tokens.next()) {
                (Some(name), Some(port)) => ports.insert(name, port),
                _ => {
                    return Err(DriverError::malformed(
                        line_no,
                        format!("expected '<name> <port>', found '{}'", line.trim()),
                    ))
                }
            }
        }

        // Separator between the two sections
        let _ = next_line()?;

        let mut events = Vec::new();
        while let Some((line_no, line)) = next_line()? {
            if line.trim().is_empty() {
                continue;
            }
            events.push(parse_event(line_no, &line)?);
        }

        Ok(Self { ports, events })
    }

    /// Participants that have a launch event, in first-launch order
    pub fn launched_participants(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for event in self.events.iter().filter(|e| e.action.is_launch()) {
            if !seen.contains(&event.participant.as_str()) {
                seen.push(event.participant.as_str());
            }
        }
        seen
    }
}

impl FromStr for Scenario {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_reader(s.as_bytes())
    }
}

fn parse_event(line_no: usize, line: &str) -> DriverResult<Event> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 {
        return Err(DriverError::malformed(
            line_no,
            format!(
                "expected '<timestamp> <participant> <command>', found '{}'",
                line.trim()
            ),
        ));
    }

    let timestamp_ms: u64 = tokens[0].parse().map_err(|_| {
        DriverError::malformed(
            line_no,
            format!("expected non-negative integer timestamp, found '{}'", tokens[0]),
        )
    })?;

    Ok(Event {
        timestamp_ms,
        participant: tokens[1].to_string(),
        action: Action::from_payload(tokens[2..].join(" ")),
    })
}
