//! Compiler errors.
//!
//! Every fallible operation returns an [`Error`]. Callers that cannot recover
//! attach a short note naming the stage that failed and pass the error on, so
//! a failure deep inside a layer reads like a small backtrace:
//!
//! ```text
//! error[shape]: expect input.dims[1] == input_dim for dense layer. got 10 vs 784
//!   note: failed to emit 0-th layer
//!   note: failed to compile sequential module
//! ```
//!
//! IR defects (a register defined twice, an operand read before its
//! producer, a flattened batch that disagrees with its list) are not errors:
//! they panic, because they point at a bug in emission code rather than at
//! bad input.

use std::fmt;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// What went wrong, coarsely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid layer/optimizer/model configuration. Raised before any
    /// register is allocated.
    Config,
    /// A tensor shape does not match what an emitter expects.
    Shape,
    /// Wrong number of inputs handed to an emitter.
    Arity,
    /// Allocation or execution failure reported by the register space.
    Register,
    /// Reading or parsing an external file.
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::Shape => "shape",
            ErrorKind::Arity => "arity",
            ErrorKind::Register => "register",
            ErrorKind::Io => "io",
        };
        f.write_str(name)
    }
}

/// A compiler error plus the notes collected while it travelled upward.
#[derive(Clone, Debug, Error)]
#[error("error[{kind}]: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub notes: Vec<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            notes: Vec::new(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Shape, message)
    }

    pub fn arity(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Arity, message)
    }

    pub fn register(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Register, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Message followed by one indented line per note, oldest first.
    pub fn render(&self) -> String {
        let mut out = self.to_string();
        for note in &self.notes {
            out.push_str("\n  note: ");
            out.push_str(note);
        }
        out
    }
}

/// Annotate an error on its way up.
pub trait ResultExt<T> {
    fn note(self, note: impl Into<String>) -> Result<T>;

    /// Like [`ResultExt::note`] but the note is only built on failure.
    fn with_note<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for Result<T> {
    fn note(self, note: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_note(note))
    }

    fn with_note<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.with_note(f()))
    }
}
