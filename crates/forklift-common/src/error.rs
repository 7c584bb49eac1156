//! Error types for the Forklift migration controller
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the VM reference (when known) so that a failure surfaced on
//! a Migration can be traced back to the source VM and the step that failed.
//!
//! Errors fall into three categories that the pipeline handles differently:
//! - transient: requeue and retry ([`Error::is_retryable`] is true)
//! - concern: produced by validators, never raised as an [`Error`]
//! - fatal per-VM: the VM moves to `Failed` ([`Error::is_fatal`] is true)

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Forklift operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid plan, mapping or inventory data
    #[error("validation error for {vm}: {message}")]
    Validation {
        /// Source VM reference
        vm: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.pvcNameTemplate")
        field: Option<String>,
    },

    /// Source provider error (power, snapshot, inventory)
    #[error("provider error [{provider}] for {vm}: {message}")]
    Provider {
        /// Source VM reference
        vm: String,
        /// Provider kind (vsphere, ovirt, openstack, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// HTTP call to a provider service or the inventory failed
    #[error("http error calling {endpoint}: {message}")]
    Http {
        /// Endpoint path that was called
        endpoint: String,
        /// Description of what failed
        message: String,
        /// HTTP status code, if a response was received
        status: Option<u16>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Template rendering error
    #[error("template error in '{template}': {message}")]
    Template {
        /// The template source
        template: String,
        /// Description of what failed
        message: String,
    },

    /// The provider does not support volume populators; use DataVolumes
    #[error("volume populator not supported")]
    VolumePopulatorNotSupported,

    /// A convert Job exhausted its retries
    #[error("convert job failed for pvc {pvc}")]
    ConvertJobFailed {
        /// Name of the source PVC
        pvc: String,
    },

    /// Error raised by a pipeline step, wrapped with the VM and step
    #[error("{step} failed for vm {vm}: {source}")]
    Step {
        /// Source VM reference
        vm: String,
        /// Pipeline step name
        step: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "ensurer")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            vm: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with VM context
    pub fn validation_for(vm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            vm: vm.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with VM context and field path
    pub fn validation_for_field(
        vm: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            vm: vm.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        vm: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            vm: vm.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., unsupported operation)
    pub fn provider_permanent(
        vm: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            vm: vm.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create an HTTP error for a failed request
    pub fn http(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            message: msg.into(),
            status: None,
        }
    }

    /// Create an HTTP error for a non-success status code
    pub fn http_status(endpoint: impl Into<String>, status: u16, msg: impl Into<String>) -> Self {
        Self::Http {
            endpoint: endpoint.into(),
            message: msg.into(),
            status: Some(status),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a template error
    pub fn template(template: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Template {
            template: template.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Wrap this error with the VM reference and pipeline step it came from
    pub fn in_step(self, vm: impl Into<String>, step: impl Into<String>) -> Self {
        Self::Step {
            vm: vm.into(),
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// Check if this error is retryable
    ///
    /// Conflicts (409) are transient: a stale listing or a concurrent write
    /// resolves on the next reconcile. Other 4xx API errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) if ae.code == 409 => true,
                kube::Error::Api(ae) => !(400..500).contains(&ae.code),
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::Http { status, .. } => !matches!(status, Some(s) if (400..500).contains(s)),
            Error::Serialization { .. } => false,
            Error::Template { .. } => false,
            Error::VolumePopulatorNotSupported => false,
            Error::ConvertJobFailed { .. } => false,
            Error::Step { source, .. } => source.is_retryable(),
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error should fail the VM rather than requeue
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable()
    }

    /// Get the VM reference if this error is associated with one
    pub fn vm(&self) -> Option<&str> {
        match self {
            Error::Validation { vm, .. } => Some(vm),
            Error::Provider { vm, .. } => Some(vm),
            Error::Step { vm, .. } => Some(vm),
            _ => None,
        }
    }

    /// Whether this is an AlreadyExists conflict from a create
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::Kube { source } => is_already_exists(source),
            Error::Step { source, .. } => source.is_already_exists(),
            _ => false,
        }
    }

    /// Whether this is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube { source } => is_not_found(source),
            Error::Step { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether this is (or wraps) the populator-not-supported sentinel
    pub fn is_populator_not_supported(&self) -> bool {
        match self {
            Error::VolumePopulatorNotSupported => true,
            Error::Step { source, .. } => source.is_populator_not_supported(),
            _ => false,
        }
    }
}

/// Whether a kube error is a 404 from the API server
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error is an AlreadyExists conflict from a create
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} happened"),
            reason: reason.to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Categories During a VM Migration
    // ==========================================================================
    //
    // The pipeline decides between "requeue" and "fail the VM" purely from
    // the error. These stories walk through the errors a single VM can hit.

    /// Story: API server hiccups are transient and requeue the VM
    #[test]
    fn story_transient_kube_errors_requeue() {
        let err: Error = api_error(500, "InternalError").into();
        assert!(err.is_retryable());

        // Stale listing: create raced with another reconcile
        let err: Error = api_error(409, "AlreadyExists").into();
        assert!(err.is_retryable());
        assert!(!err.is_fatal());

        // A forbidden create will not fix itself
        let err: Error = api_error(403, "Forbidden").into();
        assert!(!err.is_retryable());
    }

    /// Story: an exhausted convert Job fails the VM, other VMs continue
    #[test]
    fn story_convert_exhaustion_is_fatal() {
        let err = Error::ConvertJobFailed {
            pvc: "vm-1-disk-0".to_string(),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("vm-1-disk-0"));

        let wrapped = err.in_step("vm-1", "ImageConversion");
        assert!(wrapped.is_fatal());
        assert_eq!(wrapped.vm(), Some("vm-1"));
        assert!(wrapped.to_string().contains("ImageConversion"));
    }

    /// Story: providers without populators fall through to DataVolumes
    #[test]
    fn story_populator_sentinel_survives_wrapping() {
        let err = Error::VolumePopulatorNotSupported;
        assert!(err.is_populator_not_supported());
        assert!(err
            .in_step("vm-7", "DiskAllocation")
            .is_populator_not_supported());
        assert!(!Error::internal("x").is_populator_not_supported());
    }

    /// Story: dynamic provider services return status codes we classify
    #[test]
    fn story_http_status_classification() {
        let err = Error::http_status("/vms/vm-1/build-spec", 503, "unavailable");
        assert!(err.is_retryable());

        let err = Error::http_status("/vms/vm-1/build-spec", 404, "no such vm");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("/vms/vm-1/build-spec"));

        // Timeouts have no status and are retried by the outer pipeline
        assert!(Error::http("/vms/vm-1/v2v-input-type", "timed out").is_retryable());
    }

    #[test]
    fn test_validation_with_field() {
        let err = Error::validation_for_field("vm-1", "spec.pvcNameTemplate", "not a DNS label");
        match &err {
            Error::Validation { field, vm, .. } => {
                assert_eq!(field.as_deref(), Some("spec.pvcNameTemplate"));
                assert_eq!(vm, "vm-1");
            }
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_provider_retryability() {
        assert!(Error::provider_for("vm-1", "vsphere", "session expired").is_retryable());
        assert!(!Error::provider_permanent("vm-1", "hyperv", "warm unsupported").is_retryable());
    }

    #[test]
    fn test_default_context() {
        match Error::validation("x") {
            Error::Validation { vm, .. } => assert_eq!(vm, UNKNOWN_CONTEXT),
            _ => panic!("Expected Validation variant"),
        }
        assert!(Error::internal("x").to_string().contains("[unknown]"));
    }

    #[test]
    fn test_kube_sentinels() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "AlreadyExists")));
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));

        let err: Error = api_error(409, "AlreadyExists").into();
        assert!(err.is_already_exists());
        assert!(err.in_step("vm-1", "DiskAllocation").is_already_exists());
        let err: Error = api_error(404, "NotFound").into();
        assert!(err.is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }
}
