use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::Error;

/// Share of traffic this deployment should take, 0 to 100.
///
/// Zero marks a passive deployment (for example the standby region in an
/// active/passive pair), which must never hold leases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterWeight(u8);

impl ClusterWeight {
    pub const PASSIVE: Self = Self(0);
    pub const ACTIVE: Self = Self(100);

    pub fn new(weight: u32) -> Result<Self, Error> {
        if weight > 100 {
            return Err(Error::InvalidWeight(weight));
        }
        Ok(Self(weight as u8))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_active(self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for ClusterWeight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source of the current cluster weight. Polled on every lease check, so
/// implementations must be cheap and non-blocking.
pub trait ClusterWeightProvider: Send + Sync {
    fn weight(&self) -> ClusterWeight;
}

/// Always fully active. For single-region deployments.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActiveClusterWeight;

impl ClusterWeightProvider for ActiveClusterWeight {
    fn weight(&self) -> ClusterWeight {
        ClusterWeight::ACTIVE
    }
}

/// Weight that can be changed at runtime.
///
/// An external failover signal writes into it; lease checks read it.
#[derive(Debug)]
pub struct AtomicClusterWeight {
    weight: AtomicU8,
}

impl AtomicClusterWeight {
    pub fn new(weight: ClusterWeight) -> Self {
        Self {
            weight: AtomicU8::new(weight.get()),
        }
    }

    pub fn set(&self, weight: ClusterWeight) {
        let previous = self.weight.swap(weight.get(), Ordering::AcqRel);
        if previous != weight.get() {
            tracing::info!(previous, current = weight.get(), "Cluster weight changed");
        }
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidWeight`] for values above 100; the current
    /// weight is left untouched.
    pub fn set_weight(&self, weight: u32) -> Result<(), Error> {
        self.set(ClusterWeight::new(weight)?);
        Ok(())
    }
}

impl Default for AtomicClusterWeight {
    fn default() -> Self {
        Self::new(ClusterWeight::ACTIVE)
    }
}

impl ClusterWeightProvider for AtomicClusterWeight {
    fn weight(&self) -> ClusterWeight {
        ClusterWeight(self.weight.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_range() {
        assert_eq!(ClusterWeight::new(0).unwrap(), ClusterWeight::PASSIVE);
        assert_eq!(ClusterWeight::new(100).unwrap(), ClusterWeight::ACTIVE);
        assert!(ClusterWeight::new(42).unwrap().is_active());
        assert!(!ClusterWeight::PASSIVE.is_active());
        assert!(matches!(ClusterWeight::new(101), Err(Error::InvalidWeight(101))));
    }

    #[test]
    fn test_atomic_weight_flips() {
        let weight = AtomicClusterWeight::default();
        assert_eq!(weight.weight(), ClusterWeight::ACTIVE);

        weight.set_weight(0).unwrap();
        assert!(!weight.weight().is_active());

        assert!(weight.set_weight(250).is_err());
        assert_eq!(weight.weight(), ClusterWeight::PASSIVE);
    }

    #[test]
    fn test_active_weight_is_always_active() {
        assert_eq!(ActiveClusterWeight.weight().get(), 100);
    }
}
