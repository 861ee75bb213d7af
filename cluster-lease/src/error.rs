use thiserror::Error;

/// Error returned by a [`LeaseListener`](crate::LeaseListener) callback.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum Error {
    /// The mapper has nobody to assign the resource to. Callers decide whether
    /// and when to retry.
    #[error("No members available to own resource {resource_id}")]
    NoMembersAvailable { resource_id: String },

    #[error("Cluster weight {0} is out of range (expected 0-100)")]
    InvalidWeight(u32),

    #[error("Listener for lease {lease} failed")]
    Listener {
        lease: String,
        #[source]
        source: ListenerError,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn no_members(resource_id: &str) -> Self {
        Self::NoMembersAvailable {
            resource_id: resource_id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_listener_error_keeps_cause_in_source() {
        let err = Error::Listener {
            lease: "nightly-report".into(),
            source: "disk full".into(),
        };

        assert_eq!(err.to_string(), "Listener for lease nightly-report failed");
        assert_eq!(err.source().map(|e| e.to_string()).as_deref(), Some("disk full"));
    }
}
