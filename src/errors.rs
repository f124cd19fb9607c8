//! Error taxonomy and recovery policy for generation runs.
//!
//! Every failure the core produces is a [`GenerationError`] tagged with one
//! of a closed set of [`ErrorCategory`] values. Whether an error can be
//! recovered from is a pure function of its category; the coordinator
//! combines that with an [`ErrorContext`] describing the current attempt to
//! decide between retrying, switching to fallback generation, or failing.

use crate::model::PipelinePhase;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Number of attempts after which neither retry nor further executor runs
/// are allowed. Attempt numbers start at 1, so this permits one retry.
pub const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ToolNotFound,
    ToolExecution,
    InvalidConfig,
    FileSystem,
    Security,
    Integration,
    Validation,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 9] = [
        ErrorCategory::ToolNotFound,
        ErrorCategory::ToolExecution,
        ErrorCategory::InvalidConfig,
        ErrorCategory::FileSystem,
        ErrorCategory::Security,
        ErrorCategory::Integration,
        ErrorCategory::Validation,
        ErrorCategory::Timeout,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ToolNotFound => "TOOL_NOT_FOUND",
            Self::ToolExecution => "TOOL_EXECUTION",
            Self::InvalidConfig => "INVALID_CONFIG",
            Self::FileSystem => "FILE_SYSTEM",
            Self::Security => "SECURITY",
            Self::Integration => "INTEGRATION",
            Self::Validation => "VALIDATION",
            Self::Timeout => "TIMEOUT",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Fixed recoverability table.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::InvalidConfig | Self::Security | Self::Unknown)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown error category '{0}'")]
pub struct UnknownCategory(pub String);

impl FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|category| category.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

/// The error type produced by the generation core.
///
/// `recoverable` is derived from the category at construction and cannot be
/// changed afterwards.
#[derive(Debug)]
pub struct GenerationError {
    category: ErrorCategory,
    message: String,
    cause: Option<BoxError>,
    component: Option<String>,
    recoverable: bool,
    suggestions: Vec<String>,
}

impl GenerationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            cause: None,
            component: None,
            recoverable: category.is_recoverable(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions.extend(suggestions.into_iter().map(Into::into));
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    pub fn component(&self) -> Option<&str> {
        self.component.as_deref()
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    // Constructors with the suggestions users most often need for each
    // category.

    pub fn tool_not_found(tool: &str, install_hint: Option<&str>) -> Self {
        let err = Self::new(
            ErrorCategory::ToolNotFound,
            format!("required tool '{tool}' was not found in PATH"),
        )
        .with_suggestion(format!("Install '{tool}' and make sure it is on your PATH"));
        let err = match install_hint {
            Some(url) => err.with_suggestion(format!("Installation instructions: {url}")),
            None => err,
        };
        err.with_suggestion("Re-run with --offline to generate a skeleton without external tools")
    }

    pub fn tool_execution(tool: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ToolExecution, message).with_suggestions([
            format!("Run '{tool}' manually to inspect its output"),
            "Re-run with --verbose to stream tool output".to_string(),
            "Re-run with --offline to use the built-in skeleton instead".to_string(),
        ])
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::InvalidConfig, message)
            .with_suggestion("Check the component list and project name for typos")
    }

    pub fn file_system(message: impl Into<String>, cause: std::io::Error) -> Self {
        Self::new(ErrorCategory::FileSystem, message)
            .with_cause(cause)
            .with_suggestions([
                "Check that the output directory is writable",
                "Check available disk space",
            ])
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Security, message)
    }

    pub fn integration(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Integration, message)
            .with_suggestion("Inspect the generated components; they were produced before integration failed")
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, message)
    }

    pub fn timeout(operation: &str, after: Option<Duration>) -> Self {
        let message = match after {
            Some(after) => format!("{operation} timed out after {}s", after.as_secs_f64()),
            None => format!("{operation} was cancelled before it completed"),
        };
        Self::new(ErrorCategory::Timeout, message).with_suggestions([
            "Increase the tool timeout in ~/.stratum/config.toml",
            "Check your network connection",
        ])
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, message)
    }
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] ", self.category)?;
        if let Some(component) = &self.component {
            write!(f, "Component '{component}': ")?;
        }
        f.write_str(&self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " (caused by: {cause})")?;
        }
        if !self.suggestions.is_empty() {
            f.write_str("\n\nSuggestions:")?;
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                write!(f, "\n  {}. {}", i + 1, suggestion)?;
            }
        }
        Ok(())
    }
}

impl StdError for GenerationError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// Facts about the attempt that just failed. Built fresh for every attempt.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub operation: String,
    pub component: String,
    pub phase: PipelinePhase,
    /// 1-based.
    pub attempt_number: u32,
    pub can_retry: bool,
    pub can_fallback: bool,
}

impl ErrorContext {
    pub fn new(operation: &str, component: &str, phase: PipelinePhase) -> Self {
        Self {
            operation: operation.to_string(),
            component: component.to_string(),
            phase,
            attempt_number: 1,
            can_retry: true,
            can_fallback: true,
        }
    }

    pub fn attempt(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }

    pub fn retry(mut self, can_retry: bool) -> Self {
        self.can_retry = can_retry;
        self
    }

    pub fn fallback(mut self, can_fallback: bool) -> Self {
        self.can_fallback = can_fallback;
        self
    }
}

/// Transient categories are retried once.
pub fn should_retry(err: &GenerationError, ctx: &ErrorContext) -> bool {
    if !ctx.can_retry || ctx.attempt_number >= MAX_ATTEMPTS || !err.is_recoverable() {
        return false;
    }
    matches!(
        err.category(),
        ErrorCategory::ToolExecution | ErrorCategory::FileSystem | ErrorCategory::Timeout
    )
}

/// A missing tool falls back immediately; a failing tool only after its
/// retry has been spent.
pub fn should_fallback(err: &GenerationError, ctx: &ErrorContext) -> bool {
    if !ctx.can_fallback {
        return false;
    }
    match err.category() {
        ErrorCategory::ToolNotFound => true,
        ErrorCategory::ToolExecution => ctx.attempt_number >= MAX_ATTEMPTS,
        _ => false,
    }
}

/// Folds independent failures into one report.
///
/// The combined error keeps the shared category when every input agrees and
/// is `UNKNOWN` otherwise; suggestions are merged without duplicates.
pub fn aggregate_errors(mut errors: Vec<GenerationError>) -> Option<GenerationError> {
    match errors.len() {
        0 => None,
        1 => errors.pop(),
        n => {
            let first = errors[0].category();
            let category = if errors.iter().all(|e| e.category() == first) {
                first
            } else {
                ErrorCategory::Unknown
            };

            let mut message = format!("multiple errors occurred ({n}):");
            let mut suggestions: Vec<String> = Vec::new();
            for (i, err) in errors.iter().enumerate() {
                match err.component() {
                    Some(component) => {
                        message.push_str(&format!("\n  {}. {} ({})", i + 1, err.message(), component))
                    }
                    None => message.push_str(&format!("\n  {}. {}", i + 1, err.message())),
                }
                for suggestion in err.suggestions() {
                    if !suggestions.contains(suggestion) {
                        suggestions.push(suggestion.clone());
                    }
                }
            }

            Some(GenerationError::new(category, message).with_suggestions(suggestions))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryAction {
    pub name: String,
    pub description: String,
}

/// User-facing guidance for a category of failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStrategy {
    pub description: String,
    pub actions: Vec<RecoveryAction>,
}

impl RecoveryStrategy {
    fn new(description: &str, actions: &[(&str, &str)]) -> Self {
        Self {
            description: description.to_string(),
            actions: actions
                .iter()
                .map(|(name, description)| RecoveryAction {
                    name: name.to_string(),
                    description: description.to_string(),
                })
                .collect(),
        }
    }

    /// Looks up a strategy by category tag. Unrecognised tags get a generic
    /// description and no actions.
    pub fn for_tag(tag: &str) -> Self {
        match tag.parse::<ErrorCategory>() {
            Ok(category) => recovery_strategy(category),
            Err(_) => Self::new(&format!("No recovery guidance for '{tag}'"), &[]),
        }
    }
}

pub fn recovery_strategy(category: ErrorCategory) -> RecoveryStrategy {
    match category {
        ErrorCategory::ToolNotFound => RecoveryStrategy::new(
            "A required external tool is not installed",
            &[
                ("install_tool", "Install the missing tool and re-run"),
                ("use_fallback", "Generate a built-in skeleton instead"),
                ("check_path", "Verify the tool's directory is on PATH"),
            ],
        ),
        ErrorCategory::ToolExecution => RecoveryStrategy::new(
            "An external tool ran but failed",
            &[
                ("retry", "Retry the tool invocation once"),
                ("use_fallback", "Generate a built-in skeleton instead"),
                ("inspect_output", "Re-run with --verbose and read the tool output"),
            ],
        ),
        ErrorCategory::InvalidConfig => RecoveryStrategy::new(
            "The generation request is invalid",
            &[("fix_config", "Correct the project name or component list")],
        ),
        ErrorCategory::FileSystem => RecoveryStrategy::new(
            "A filesystem operation failed",
            &[
                ("retry", "Retry the operation once"),
                ("check_permissions", "Make sure the output directory is writable"),
                ("free_space", "Free disk space"),
            ],
        ),
        ErrorCategory::Security => RecoveryStrategy::new(
            "The request was rejected for security reasons",
            &[("review_input", "Review paths and names for traversal or injection")],
        ),
        ErrorCategory::Integration => RecoveryStrategy::new(
            "Components were generated but could not be integrated",
            &[
                ("inspect_components", "Check each component's output"),
                ("rerun", "Re-run generation after fixing the component"),
            ],
        ),
        ErrorCategory::Validation => RecoveryStrategy::new(
            "Generated output did not have the expected structure",
            &[
                ("inspect_output", "Inspect the output directory"),
                ("force_overwrite", "Re-run with --force if the target already existed"),
            ],
        ),
        ErrorCategory::Timeout => RecoveryStrategy::new(
            "An operation did not finish in time",
            &[
                ("retry", "Retry the operation once"),
                ("increase_timeout", "Raise tool_timeout_secs in the configuration"),
                ("go_offline", "Re-run with --offline to avoid network access"),
            ],
        ),
        ErrorCategory::Unknown => RecoveryStrategy::new(
            "An unexpected error occurred",
            &[("verbose", "Re-run with --verbose and report the output")],
        ),
    }
}
