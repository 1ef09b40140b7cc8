//! License/entitlement gate consulted on registration.

/// Source of the maximum number of concurrently registered instances.
pub trait Entitlements: Send + Sync {
    /// `None` means unlimited.
    fn max_instances(&self) -> Option<usize>;
}

/// Fixed limit, usually from configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEntitlements {
    max_instances: Option<usize>,
}

impl StaticEntitlements {
    pub fn new(max_instances: Option<usize>) -> Self {
        Self { max_instances }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }
}

impl Entitlements for StaticEntitlements {
    fn max_instances(&self) -> Option<usize> {
        self.max_instances
    }
}
