//! Severity-ranked outcomes of reconcile sub-operations
//!
//! Merging, installing and restarting each report a [`DescribedOutcome`]
//! instead of aborting the reconcile. [`most_severe`] folds them into the one
//! outcome that determines the resource status.

use std::fmt;

use crate::Error;

/// Severity of a described outcome
///
/// Lower ordinal is more severe, so `Error` outranks `Warning`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Blocks the reconcile and puts the resource into the Error state
    Error = 0,
    /// Blocks only the affected operation and puts the resource into the Warning state
    Warning = 1,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "Error"),
            Severity::Warning => write!(f, "Warning"),
        }
    }
}

/// A failure paired with a user facing description and a severity
#[derive(Debug)]
pub struct DescribedOutcome {
    error: Error,
    description: String,
    severity: Severity,
    set_condition: bool,
}

impl DescribedOutcome {
    /// Error-severity outcome whose description is prefixed to the error text
    pub fn new(error: Error, description: impl Into<String>) -> Self {
        Self {
            error,
            description: description.into(),
            severity: Severity::Error,
            set_condition: true,
        }
    }

    /// Downgrade to Warning severity
    pub fn warning(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    /// Control whether this outcome should also be reflected as a status condition
    ///
    /// Callers that record their own condition before stopping pass `false`.
    pub fn with_condition(mut self, set_condition: bool) -> Self {
        self.set_condition = set_condition;
        self
    }

    /// Severity of this outcome
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Underlying error
    pub fn error(&self) -> &Error {
        &self.error
    }

    /// Whether the caller should record a status condition for this outcome
    pub fn should_set_condition(&self) -> bool {
        self.set_condition
    }

    /// Human readable description followed by the error text
    pub fn description(&self) -> String {
        format!("{}: {}", self.description, self.error)
    }

    /// The description as given, without the error text
    pub fn short_description(&self) -> &str {
        &self.description
    }

    /// Whether this outcome is a warning
    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }
}

impl fmt::Display for DescribedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Reduce outcomes to the single most severe one
///
/// `None` entries are successes and never win. Among the rest the strictly
/// more severe outcome wins and ties keep the first seen. Returns `None` when
/// nothing failed.
pub fn most_severe<I>(outcomes: I) -> Option<DescribedOutcome>
where
    I: IntoIterator<Item = Option<DescribedOutcome>>,
{
    outcomes
        .into_iter()
        .flatten()
        .fold(None, |current: Option<DescribedOutcome>, next| match current {
            Some(current) if current.severity <= next.severity => Some(current),
            _ => Some(next),
        })
}
