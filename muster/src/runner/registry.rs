use super::wrapped_job::{BoxedJobHandler, WrappedJobHandler};
use crate::core::job_processor::{JobError, JobProcessor};
use crate::core::job_type::{validate_job_type, JobTypeError};
use crate::core::queue::ClaimFilter;
use crate::dispatcher::PayloadValidator;
use std::collections::BTreeMap;
use thiserror::Error;

type PayloadCheck = fn(&serde_json::Value) -> Result<(), JobError>;

struct Registered {
    handler: BoxedJobHandler,
    validate: PayloadCheck,
    max_attempts: u32,
}

/// Maps job type names to handlers.
///
/// Built once at startup and shared read-only by workers. A worker serving a
/// prefix only claims the types registered under it.
///
/// ## Example
/// ```rust
/// use muster::prelude::*;
/// use muster::runner::registry::HandlerRegistry;
///
/// struct Compact;
///
/// impl JobType for Compact {
///     fn job_type() -> &'static str {
///         "memory.compact"
///     }
/// }
///
/// #[async_trait::async_trait]
/// impl JobProcessor for Compact {
///     type Payload = ();
///     type Error = std::convert::Infallible;
///
///     async fn handle(&self, _ctx: JobContext, _payload: ()) -> Result<(), Self::Error> {
///         Ok(())
///     }
/// }
///
/// let mut registry = HandlerRegistry::default();
/// registry.register(Compact).unwrap();
/// assert!(registry.validate_prefix("memory.").is_ok());
/// assert!(registry.validate_prefix("events.").is_err());
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<&'static str, Registered>,
}

impl HandlerRegistry {
    /// Register a handler under `J::job_type()`.
    pub fn register<J>(&mut self, job: J) -> Result<&mut Self, RegistryError>
    where
        J: JobProcessor + 'static,
    {
        let job_type = J::job_type();
        validate_job_type(job_type).map_err(|source| RegistryError::InvalidJobType {
            job_type: job_type.to_string(),
            source,
        })?;
        if self.handlers.contains_key(job_type) {
            return Err(RegistryError::DuplicateJobType(job_type.to_string()));
        }

        tracing::debug!(job_type, "Registered job handler");
        self.handlers.insert(
            job_type,
            Registered {
                handler: WrappedJobHandler::new(job).boxed(),
                validate: WrappedJobHandler::<J>::validate,
                max_attempts: J::max_attempts(),
            },
        );
        Ok(self)
    }

    pub fn get(&self, job_type: &str) -> Option<&BoxedJobHandler> {
        self.handlers.get(job_type).map(|r| &r.handler)
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Every registered job type, sorted.
    pub fn job_types(&self) -> Vec<&'static str> {
        self.handlers.keys().copied().collect()
    }

    pub fn job_types_for_prefix(&self, prefix: &str) -> Vec<&'static str> {
        self.handlers
            .keys()
            .copied()
            .filter(|job_type| job_type.starts_with(prefix))
            .collect()
    }

    /// Fails when nothing is registered under `prefix`; a worker for it would never
    /// claim anything.
    pub fn validate_prefix(&self, prefix: &str) -> Result<(), RegistryError> {
        if self.job_types_for_prefix(prefix).is_empty() {
            return Err(RegistryError::NoHandlersForPrefix(prefix.to_string()));
        }
        Ok(())
    }

    /// Claim filter limited to the types registered under `prefix`.
    pub fn claim_filter(&self, prefix: &str) -> ClaimFilter {
        ClaimFilter::prefix(prefix).with_job_types(self.job_types_for_prefix(prefix))
    }

    /// Decode `payload` against the handler of `job_type` without running it.
    pub fn check_payload(
        &self,
        job_type: &str,
        payload: &serde_json::Value,
    ) -> Result<(), RegistryError> {
        let registered = self
            .handlers
            .get(job_type)
            .ok_or_else(|| RegistryError::UnknownJobType(job_type.to_string()))?;
        (registered.validate)(payload).map_err(|source| RegistryError::InvalidPayload {
            job_type: job_type.to_string(),
            source,
        })
    }

    pub fn max_attempts(&self, job_type: &str) -> Option<u32> {
        self.handlers.get(job_type).map(|r| r.max_attempts)
    }
}

impl PayloadValidator for HandlerRegistry {
    fn validate_payload(&self, job_type: &str, payload: &serde_json::Value) -> Result<(), String> {
        self.check_payload(job_type, payload)
            .map_err(|e| e.to_string())
    }

    fn default_max_attempts(&self, job_type: &str) -> Option<u32> {
        self.max_attempts(job_type)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

/// Errors returned by the registry.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid job type '{job_type}': {source}")]
    InvalidJobType {
        job_type: String,
        #[source]
        source: JobTypeError,
    },
    #[error("A handler for job type '{0}' is already registered")]
    DuplicateJobType(String),
    #[error("No handlers registered under prefix '{0}'")]
    NoHandlersForPrefix(String),
    #[error("No handler registered for job type '{0}'")]
    UnknownJobType(String),
    #[error("Invalid payload for job type '{job_type}': {source}")]
    InvalidPayload {
        job_type: String,
        #[source]
        source: JobError,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::job_processor::JobContext;
    use crate::core::job_type::JobType;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::convert::Infallible;

    #[derive(Serialize, Deserialize)]
    struct IngestPayload {
        memory_id: i64,
    }

    macro_rules! handler {
        ($name:ident, $job_type:literal) => {
            struct $name;

            impl JobType for $name {
                fn job_type() -> &'static str {
                    $job_type
                }
            }

            #[async_trait]
            impl JobProcessor for $name {
                type Payload = IngestPayload;
                type Error = Infallible;

                async fn handle(
                    &self,
                    _ctx: JobContext,
                    _payload: Self::Payload,
                ) -> Result<(), Infallible> {
                    Ok(())
                }
            }
        };
    }

    handler!(Ingest, "memory.ingest");
    handler!(Compact, "memory.compact");
    handler!(Normalize, "events.normalize");
    handler!(Broken, "memory..ingest");

    struct Persistent;

    impl JobType for Persistent {
        fn job_type() -> &'static str {
            "memory.persist"
        }
    }

    #[async_trait]
    impl JobProcessor for Persistent {
        type Payload = ();
        type Error = Infallible;

        async fn handle(&self, _ctx: JobContext, _payload: ()) -> Result<(), Infallible> {
            Ok(())
        }

        fn max_attempts() -> u32 {
            10
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::default();
        registry
            .register(Ingest)
            .unwrap()
            .register(Compact)
            .unwrap()
            .register(Normalize)
            .unwrap();
        registry
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut registry = registry();
        let err = registry.register(Ingest).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateJobType(ref t) if t == "memory.ingest"));
        assert_eq!(registry.job_types().len(), 3);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let mut registry = HandlerRegistry::default();
        let err = registry.register(Broken).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidJobType {
                source: JobTypeError::EmptySegment { .. },
                ..
            }
        ));
        assert!(registry.job_types().is_empty());
    }

    #[test]
    fn prefix_lookup() {
        let registry = registry();
        assert_eq!(
            registry.job_types_for_prefix("memory."),
            vec!["memory.compact", "memory.ingest"]
        );
        assert_eq!(registry.job_types_for_prefix(""), registry.job_types());
        assert!(registry.validate_prefix("memory.").is_ok());
        assert!(matches!(
            registry.validate_prefix("billing."),
            Err(RegistryError::NoHandlersForPrefix(_))
        ));

        let filter = registry.claim_filter("events.");
        assert_eq!(filter.type_prefix(), "events.");
        assert_eq!(filter.job_types(), ["events.normalize".to_string()]);
    }

    #[test]
    fn payload_validation() {
        let registry = registry();
        assert!(registry
            .check_payload("memory.ingest", &json!({"memory_id": 1}))
            .is_ok());
        assert!(matches!(
            registry.check_payload("memory.ingest", &json!({"memory_id": "one"})),
            Err(RegistryError::InvalidPayload { .. })
        ));
        assert!(matches!(
            registry.check_payload("memory.unknown", &json!({})),
            Err(RegistryError::UnknownJobType(_))
        ));
        assert!(registry
            .validate_payload("memory.unknown", &json!({}))
            .unwrap_err()
            .contains("memory.unknown"));
    }

    #[test]
    fn handler_max_attempts() {
        let mut registry = registry();
        registry.register(Persistent).unwrap();
        assert_eq!(registry.max_attempts("memory.persist"), Some(10));
        assert_eq!(registry.default_max_attempts("memory.ingest"), Some(3));
        assert_eq!(registry.max_attempts("memory.unknown"), None);
    }

    #[test]
    fn lookup_by_exact_type() {
        let registry = registry();
        assert!(registry.get("memory.ingest").is_some());
        assert!(registry.get("memory.").is_none());
        assert!(registry.contains("events.normalize"));
    }
}
