//! Lodestone error abstractions.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced while reconciling the workloads of a search cluster.
#[derive(Debug, Error)]
pub enum Error {
    /// The target object does not exist in the backend.
    ///
    /// Expected during creation and absence checks, a failure everywhere else.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// The kind of the missing object.
        kind: &'static str,
        /// The name of the missing object.
        name: String,
        /// The namespace of the missing object.
        namespace: String,
    },
    /// Conflicting concurrent writers exhausted the bounded update retries.
    #[error("conflicting writes on {namespace}/{name} exhausted {attempts} update attempts")]
    Conflict {
        /// The name of the contested object.
        name: String,
        /// The namespace of the contested object.
        namespace: String,
        /// The number of attempts made before giving up.
        attempts: u32,
    },
    /// A bounded wait exceeded its deadline.
    #[error("timed out after {}s waiting for {what}", deadline.as_secs())]
    Timeout {
        /// The condition being waited for.
        what: String,
        /// The deadline which expired.
        deadline: Duration,
    },
    /// A wait was interrupted by process shutdown.
    #[error("wait for {what} was cancelled by shutdown")]
    Cancelled {
        /// The condition being waited for.
        what: String,
    },
    /// Any other I/O failure from the workload backend or the membership client.
    #[error("backend failure for {namespace}/{name}")]
    Backend {
        /// The cluster or node group the failure pertains to.
        name: String,
        /// The namespace of that cluster.
        namespace: String,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    /// True if this error is the NotFound signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True if this error is a wait deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
