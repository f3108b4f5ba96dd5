use std::fmt;

use crate::models::LinkViolation;

pub type Result<T> = std::result::Result<T, LibError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Corrupted,
    Database,
    InvalidInput,
    NotFound,
    ProtectedField,
}

#[derive(Debug)]
pub struct LibError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub public: &'static str,
    pub violations: Vec<LinkViolation>,
    pub source: anyhow::Error,
}

impl LibError {
    pub fn database(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Database,
            code: "database_error",
            public,
            violations: Vec::new(),
            source,
        }
    }

    pub fn invalid(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::InvalidInput,
            code: "invalid_input",
            public,
            violations: Vec::new(),
            source,
        }
    }

    /// Validation failure carrying every violated rule. The code and public message
    /// come from the first violation.
    pub fn violations(violations: Vec<LinkViolation>, source: anyhow::Error) -> Self {
        let (code, public) = violations
            .first()
            .map(|first| (first.error_code(), first.public_message()))
            .unwrap_or(("invalid_input", "Link validation failed"));
        Self {
            kind: ErrorKind::InvalidInput,
            code,
            public,
            violations,
            source,
        }
    }

    pub fn protected_field(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::ProtectedField,
            code: "protected_field_violation",
            public,
            violations: Vec::new(),
            source,
        }
    }

    pub fn configuration(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Configuration,
            code: "configuration_error",
            public,
            violations: Vec::new(),
            source,
        }
    }

    pub fn corrupted(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::Corrupted,
            code: "closure_corrupted",
            public,
            violations: Vec::new(),
            source,
        }
    }

    pub fn not_found(public: &'static str, source: anyhow::Error) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            code: "not_found",
            public,
            violations: Vec::new(),
            source,
        }
    }

    pub fn has_violation(&self, violation: &LinkViolation) -> bool {
        self.violations.contains(violation)
    }
}

impl fmt::Display for LibError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.public, self.code, self.source)
    }
}

impl std::error::Error for LibError {}

#[cfg(feature = "sqlx")]
impl From<sqlx::Error> for LibError {
    fn from(value: sqlx::Error) -> Self {
        Self::database("Database request failed", anyhow::Error::new(value))
    }
}
