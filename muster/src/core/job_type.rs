//! Job type identification.
//!
//! Every handler is bound to one dot-delimited job type name such as
//! `memory.ingest`. The leading segments act as a namespace: a worker configured
//! with prefix `memory.` serves every type that starts with it.

use thiserror::Error;

/// Longest job type name the stores accept.
pub const MAX_JOB_TYPE_LEN: usize = 255;

/// A job type identifier bound to a handler at compile time.
///
/// # Example
///
/// ```rust
/// use muster::core::job_type::JobType;
///
/// struct IngestMemory;
///
/// impl JobType for IngestMemory {
///     fn job_type() -> &'static str {
///         "memory.ingest"
///     }
/// }
///
/// assert!(IngestMemory::job_type().starts_with("memory."));
/// ```
pub trait JobType: Send + Sync + 'static {
    /// The persisted name of this job type.
    ///
    /// Must satisfy [`validate_job_type`]; the registry rejects handlers whose
    /// name does not.
    fn job_type() -> &'static str
    where
        Self: Sized;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobTypeError {
    #[error("Job type must not be empty")]
    Empty,
    #[error("Job type '{0}' is longer than {max} bytes", max = MAX_JOB_TYPE_LEN)]
    TooLong(String),
    #[error("Job type '{name}' has an empty segment")]
    EmptySegment { name: String },
    #[error("Job type '{name}' contains invalid character {ch:?}")]
    InvalidCharacter { name: String, ch: char },
}

/// Checks that `name` is a well-formed job type.
///
/// Segments are separated by single dots and made of ASCII alphanumerics,
/// `_` and `-`.
pub fn validate_job_type(name: &str) -> Result<(), JobTypeError> {
    if name.is_empty() {
        return Err(JobTypeError::Empty);
    }
    if name.len() > MAX_JOB_TYPE_LEN {
        return Err(JobTypeError::TooLong(name.to_string()));
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err(JobTypeError::EmptySegment {
                name: name.to_string(),
            });
        }
        if let Some(ch) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
        {
            return Err(JobTypeError::InvalidCharacter {
                name: name.to_string(),
                ch,
            });
        }
    }
    Ok(())
}

/// Builds a SQL `LIKE` pattern that matches every job type starting with
/// `prefix`. Wildcards in the prefix are escaped with `\`, so the pattern must
/// be used with `ESCAPE '\'`.
pub fn like_prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ingest;

    impl JobType for Ingest {
        fn job_type() -> &'static str {
            "memory.ingest"
        }
    }

    #[test]
    fn job_type_name() {
        assert_eq!(Ingest::job_type(), "memory.ingest");
        assert!(validate_job_type(Ingest::job_type()).is_ok());
    }

    #[test]
    fn accepts_namespaced_names() {
        for name in ["caption", "memory.ingest", "events.normalize_v2", "a.b-c.d_e"] {
            assert!(validate_job_type(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        assert_eq!(validate_job_type(""), Err(JobTypeError::Empty));
        assert!(matches!(
            validate_job_type("memory..ingest"),
            Err(JobTypeError::EmptySegment { .. })
        ));
        assert!(matches!(
            validate_job_type("memory."),
            Err(JobTypeError::EmptySegment { .. })
        ));
        assert!(matches!(
            validate_job_type("memory.in gest"),
            Err(JobTypeError::InvalidCharacter { ch: ' ', .. })
        ));
        assert!(matches!(
            validate_job_type("memory.%"),
            Err(JobTypeError::InvalidCharacter { ch: '%', .. })
        ));
        assert!(matches!(
            validate_job_type(&"a".repeat(MAX_JOB_TYPE_LEN + 1)),
            Err(JobTypeError::TooLong(_))
        ));
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_prefix_pattern("memory."), "memory.%");
        assert_eq!(like_prefix_pattern(""), "%");
        assert_eq!(like_prefix_pattern("a_b"), "a\\_b%");
        assert_eq!(like_prefix_pattern("100%"), "100\\%%");
        assert_eq!(like_prefix_pattern("x\\y"), "x\\\\y%");
    }
}
