/*!
Stackable framework errors with stable ids, and the [`Reporter`] that
aggregates them during router builds.
*/

use std::{
    error,
    fmt::{self, Display, Formatter},
    sync::Mutex,
};
use uuid::Uuid;

/**
An error value with a stable unique id.

The id survives [`FrameworkError::format`] calls, so a specific error
can still be recognized after its message was specialized with dynamic
content. Appending errors builds a stack that prints one message per
line.
*/
#[derive(Clone, Debug)]
pub struct FrameworkError {
    /// the unique id of this error
    pub id: Uuid,
    /// the rendered message
    pub message: String,
    /// whether this error has had children appended
    pub appended: bool,
    /// the appended child errors
    pub stack: Vec<FrameworkError>,
}

impl FrameworkError {
    /// Construct a new error with a fresh unique id.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message: message.into(),
            appended: false,
            stack: Vec::new(),
        }
    }

    /// Wrap a foreign error, or `None` when it is `None`-like.
    pub fn from_err(err: &dyn error::Error) -> Self {
        Self::new(err.to_string())
    }

    /// Whether `other` is the same error: matched by id when both are
    /// framework errors, by message otherwise.
    pub fn equal(&self, other: &FrameworkError) -> bool {
        self.id == other.id || self.message == other.message
    }

    /// Whether this error carries no message.
    pub fn is_empty(&self) -> bool {
        self.message.is_empty()
    }

    /// A new error with the message specialized by `args`, keeping the
    /// id. The original is not changed.
    pub fn format(&self, args: fmt::Arguments<'_>) -> Self {
        Self {
            id: self.id,
            message: self.message.replacen("{}", &fmt::format(args), 1),
            appended: self.appended,
            stack: self.stack.clone(),
        }
    }

    /// Append a message to this error without inserting a newline,
    /// recording it on the stack. Returns the combined error.
    pub fn append_inline(mut self, message: &str) -> Self {
        self.message.push_str(message);
        self.appended = true;
        self.stack
            .push(FrameworkError::new(message.trim_end_matches('\n')));
        self
    }

    /// Append a message to this error on its own line, recording it on
    /// the stack. Returns the combined error.
    pub fn append(mut self, message: &str) -> Self {
        if !self.message.is_empty() {
            self.message.push('\n');
        }
        self.append_inline(message)
    }

    /// Append a foreign error's message. Returns the combined error.
    pub fn append_err(self, err: &dyn error::Error) -> Self {
        self.append(&err.to_string())
    }

    /// Whether this error was built up through the append family.
    pub fn has_stack(&self) -> bool {
        !self.stack.is_empty()
    }
}

impl Display for FrameworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl error::Error for FrameworkError {}

impl Default for FrameworkError {
    fn default() -> Self {
        Self::new("")
    }
}

/**
Aggregates errors during multi-step operations, typically the router
build: each failing route adds an entry, and the caller gets either
`None` or one combined error at the end.
*/
#[derive(Debug, Default)]
pub struct Reporter {
    wrapper: Mutex<FrameworkError>,
}

impl Reporter {
    /// Construct an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to the error stack. Returns whether it was added.
    pub fn add(&self, message: impl AsRef<str>) -> bool {
        let message = message.as_ref();
        if message.is_empty() {
            return false;
        }
        if let Ok(mut wrapper) = self.wrapper.lock() {
            let current = std::mem::take(&mut *wrapper);
            *wrapper = current.append(message);
        }
        true
    }

    /// Add an error to the stack. A stacked error contributes each of
    /// its children individually. Returns whether anything was added.
    pub fn add_err(&self, err: &FrameworkError) -> bool {
        if err.has_stack() {
            for child in &err.stack {
                if !child.is_empty() {
                    self.add(&child.message);
                }
            }
            true
        } else if err.is_empty() {
            false
        } else {
            self.add(&err.message)
        }
    }

    /// Like [`Reporter::add`], but does nothing for `None`.
    pub fn describe(&self, prefix: &str, err: Option<&FrameworkError>) {
        if let Some(err) = err {
            if err.has_stack() {
                self.add_err(err);
            } else {
                self.add(format!("{prefix}{err}"));
            }
        }
    }

    /// The errors collected so far.
    pub fn stack(&self) -> Vec<FrameworkError> {
        self.wrapper
            .lock()
            .map(|wrapper| wrapper.stack.clone())
            .unwrap_or_default()
    }

    /// Print every collected error through the provided printer, one
    /// per line.
    pub fn print_stack(&self, mut printer: impl FnMut(&str)) {
        for err in self.stack() {
            printer(&err.message);
        }
    }

    /// `None` when no errors were collected, otherwise the combined
    /// error.
    pub fn return_err(&self) -> Option<FrameworkError> {
        self.wrapper
            .lock()
            .ok()
            .filter(|wrapper| !wrapper.is_empty())
            .map(|wrapper| wrapper.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_across_format() {
        let err = FrameworkError::new("route {} is invalid");
        let formatted = err.format(format_args!("GET /x"));
        assert_eq!(err.id, formatted.id);
        assert_eq!(formatted.message, "route GET /x is invalid");
        assert!(err.equal(&formatted));
    }

    #[test]
    fn append_builds_a_stack() {
        let err = FrameworkError::new("")
            .append("first failure")
            .append("second failure");
        assert!(err.has_stack());
        assert_eq!(err.stack.len(), 2);
        assert_eq!(err.to_string(), "first failure\nsecond failure");
    }

    #[test]
    fn reporter_aggregates() {
        let reporter = Reporter::new();
        assert!(reporter.return_err().is_none());

        reporter.add("route a failed");
        reporter.add("route b failed");
        assert!(!reporter.add(""));

        let combined = reporter.return_err().unwrap();
        assert_eq!(combined.stack.len(), 2);

        let mut lines = Vec::new();
        reporter.print_stack(|line| lines.push(line.to_string()));
        assert_eq!(lines, vec!["route a failed", "route b failed"]);
    }
}
