//! The VM-wide error taxonomy.
//!
//! Errors are first-class in Avail: a primitive that fails hands its numeric
//! error code to the failure variable of the calling function, and unhandled
//! failures surface to the fiber's failure callback as values. [`ErrorKind`]
//! is the closed set of codes the core can produce; [`VmError`] pairs a kind
//! with optional human-readable detail for the host.

use thiserror::Error;

/// Every failure the VM core can report, with its stable numeric code.
///
/// The numeric codes are part of the compiled-code wire format (primitive
/// failure variables hold them as integers), so variants must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u32)]
pub enum ErrorKind {
    /// A method lookup found no applicable definition.
    #[error("no applicable method definition")]
    NoDefinition = 1,
    /// A method lookup found two or more incomparable definitions.
    #[error("ambiguous method lookup")]
    AmbiguousLookup = 2,
    /// The most specific definition was abstract.
    #[error("abstract method invoked")]
    AbstractMethodInvoked = 3,
    /// The most specific definition was a forward declaration.
    #[error("forward-declared method invoked")]
    ForwardMethodInvoked = 4,
    /// A function was applied to the wrong number of arguments.
    #[error("incorrect number of arguments")]
    IncorrectNumberOfArguments = 5,
    /// An argument did not satisfy the corresponding parameter type.
    #[error("incorrect argument type")]
    IncorrectArgumentType = 6,
    /// A function produced a value outside its declared return type.
    #[error("incorrect return type")]
    IncorrectReturnType = 7,
    /// A variable assignment violated the variable's inner type.
    #[error("variable type mismatch")]
    VariableTypeMismatch = 8,
    /// A variable was read before ever being assigned.
    #[error("cannot read unassigned variable")]
    CannotReadUnassignedVariable = 9,
    /// A write-once variable was assigned a second time.
    #[error("cannot overwrite write-once variable")]
    CannotOverwriteWriteOnceVariable = 10,
    /// A variable write observer could not be recorded or invoked.
    #[error("variable observation failed")]
    ObserveFailed = 11,
    /// Integer division or remainder by zero.
    #[error("division by zero")]
    DivisionByZero = 12,
    /// An arithmetic operation outside its domain, e.g. `∞ - ∞` or `∞ · 0`.
    #[error("arithmetic domain error")]
    ArithmeticDomain = 13,
    /// The fiber was cancelled while running.
    #[error("fiber cancelled")]
    FiberCancelled = 14,
    /// The joined fiber terminated abnormally.
    #[error("join failed")]
    JoinFailed = 15,
    /// A pending wake-up was cancelled before it fired.
    #[error("timer cancelled")]
    TimerCancelled = 16,
    /// A definition mutation arrived after loading was declared over.
    #[error("loading is over")]
    LoadingIsOver = 17,
    /// A method name could not be split into parsing instructions.
    #[error("malformed message name")]
    MalformedMessage = 18,
    /// A raw function referenced a primitive number with no implementation.
    #[error("invalid primitive number")]
    InvalidPrimitiveNumber = 19,
    /// The fiber exhausted the runtime's allocation budget.
    #[error("memory exhausted")]
    MemoryExhausted = 20,
    /// An operation was applied to a kind that does not support it.
    #[error("operation not supported by this kind")]
    NotSupported = 21,
    /// A map lookup found no binding for the key.
    #[error("key not found in map")]
    MapKeyNotFound = 22,
}

impl ErrorKind {
    /// The stable numeric code carried in primitive failure variables.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Looks up a kind by its numeric code.
    pub fn from_code(code: u32) -> Option<ErrorKind> {
        use ErrorKind::*;
        Some(match code {
            1 => NoDefinition,
            2 => AmbiguousLookup,
            3 => AbstractMethodInvoked,
            4 => ForwardMethodInvoked,
            5 => IncorrectNumberOfArguments,
            6 => IncorrectArgumentType,
            7 => IncorrectReturnType,
            8 => VariableTypeMismatch,
            9 => CannotReadUnassignedVariable,
            10 => CannotOverwriteWriteOnceVariable,
            11 => ObserveFailed,
            12 => DivisionByZero,
            13 => ArithmeticDomain,
            14 => FiberCancelled,
            15 => JoinFailed,
            16 => TimerCancelled,
            17 => LoadingIsOver,
            18 => MalformedMessage,
            19 => InvalidPrimitiveNumber,
            20 => MemoryExhausted,
            21 => NotSupported,
            22 => MapKeyNotFound,
            _ => return None,
        })
    }
}

/// An error kind plus optional detail text for the embedding host.
#[derive(Debug, Clone, Error)]
pub struct VmError {
    /// The closed-taxonomy kind.
    pub kind: ErrorKind,
    /// Extra context, never required to interpret the error.
    pub detail: Option<String>,
}

impl VmError {
    /// Creates an error with no detail text.
    pub fn new(kind: ErrorKind) -> Self {
        VmError { kind, detail: None }
    }

    /// Creates an error with detail text.
    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        VmError {
            kind,
            detail: Some(detail.into()),
        }
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "{}: {}", self.kind, d),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl From<ErrorKind> for VmError {
    fn from(kind: ErrorKind) -> Self {
        VmError::new(kind)
    }
}

/// Alias for `std::result::Result<T, VmError>`.
pub type VmResult<T> = std::result::Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in 1..=22 {
            let kind = ErrorKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
    }

    #[test]
    fn unknown_code_is_none() {
        assert_eq!(ErrorKind::from_code(0), None);
        assert_eq!(ErrorKind::from_code(9999), None);
    }

    #[test]
    fn display_includes_detail() {
        let err = VmError::with_detail(ErrorKind::MalformedMessage, "empty name");
        let text = err.to_string();
        assert!(text.contains("malformed"));
        assert!(text.contains("empty name"));
    }
}
