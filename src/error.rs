use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::physics::{BodyHandle, JointHandle};
use crate::script::ScriptEventKind;

/// A failure raised by user script, tagged with where it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScriptError {
    pub script: String,
    pub line: Option<usize>,
    pub message: String,
}

impl ScriptError {
    pub fn new(script: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            line: None,
            message: message.into(),
        }
    }

    pub fn with_line(mut self, line: Option<usize>) -> Self {
        if line.is_some() {
            self.line = line;
        }
        self
    }

    /// Fills in `line` from the message text when it points inside `source`.
    pub fn enrich_line(mut self, source: &str) -> Self {
        if self.line.is_none() {
            self.line = line_from_message(&self.message, source);
        }
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.script, line, self.message),
            None => write!(f, "{}: {}", self.script, self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

/// Finds a `line N` or `:N:` marker in `message` that lies within `source`.
pub fn line_from_message(message: &str, source: &str) -> Option<usize> {
    let line_count = source.lines().count().max(1);
    let in_source = |line: usize| (1..=line_count).contains(&line);

    let lower = message.to_ascii_lowercase();
    let mut rest = lower.as_str();
    while let Some(idx) = rest.find("line ") {
        let after = &rest[idx + 5..];
        let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(line) = digits.parse::<usize>() {
            if in_source(line) {
                return Some(line);
            }
        }
        rest = after;
    }

    for part in message.split(':').skip(1) {
        let trimmed = part.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(line) = trimmed.parse::<usize>() {
            if in_source(line) {
                return Some(line);
            }
        }
    }
    None
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InvalidReference {
    #[error("body {0} is no longer valid")]
    Body(BodyHandle),
    #[error("joint {0} is no longer valid")]
    Joint(JointHandle),
}

#[derive(Clone, Debug, Error)]
pub enum SimError {
    #[error("a simulation session is already active")]
    AlreadyActive,
    #[error("no simulation session is active")]
    NotActive,
    #[error("admission script failed: {0}")]
    AdmissionScript(ScriptError),
    #[error("controller `{controller}` failed: {error}")]
    ControllerEvaluation { controller: String, error: ScriptError },
    #[error("{event} callback on body {body} failed: {error}")]
    EventCallback {
        event: ScriptEventKind,
        body: BodyHandle,
        error: ScriptError,
    },
    #[error(transparent)]
    InvalidReference(#[from] InvalidReference),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid scene: {0}")]
    Scene(String),
}

impl SimError {
    /// The script failure behind this error, for jumping to the offending line.
    pub fn script_error(&self) -> Option<&ScriptError> {
        match self {
            SimError::AdmissionScript(error)
            | SimError::ControllerEvaluation { error, .. }
            | SimError::EventCallback { error, .. } => Some(error),
            _ => None,
        }
    }
}
