use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RvResult<T> = Result<T, RvError>;
pub type PipelineResult<T> = RvResult<T>;

/// Fatal-error categories with a stable process exit code each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RvErrorCategory {
    Success,
    InputValidation,
    IoSystem,
    Computation,
    Internal,
}

impl RvErrorCategory {
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::InputValidation => 2,
            Self::IoSystem => 3,
            Self::Computation => 4,
            Self::Internal => 5,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::InputValidation => "InputValidation",
            Self::IoSystem => "IoSystem",
            Self::Computation => "Computation",
            Self::Internal => "Internal",
        }
    }

    pub const fn is_fatal(self) -> bool {
        !matches!(self, Self::Success)
    }
}

/// Run-level error: a category, a stable uppercase code for scripting
/// against diagnostics, and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RvError {
    category: RvErrorCategory,
    code: &'static str,
    message: String,
}

impl RvError {
    pub fn new(category: RvErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
        }
    }

    pub fn input_validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RvErrorCategory::InputValidation, code, message)
    }

    pub fn io_system(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RvErrorCategory::IoSystem, code, message)
    }

    pub fn computation(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RvErrorCategory::Computation, code, message)
    }

    pub fn internal(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(RvErrorCategory::Internal, code, message)
    }

    pub const fn category(&self) -> RvErrorCategory {
        self.category
    }

    pub const fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn exit_code(&self) -> i32 {
        self.category.exit_code()
    }

    pub fn diagnostic_line(&self) -> String {
        let severity = if self.category.is_fatal() { "ERROR" } else { "INFO" };
        format!("{severity}: [{}] {}", self.code, self.message)
    }

    pub fn fatal_exit_line(&self) -> Option<String> {
        self.category
            .is_fatal()
            .then(|| format!("FATAL EXIT CODE: {}", self.exit_code()))
    }
}

impl Display for RvError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.category.label(),
            self.code,
            self.message
        )
    }
}

impl Error for RvError {}
