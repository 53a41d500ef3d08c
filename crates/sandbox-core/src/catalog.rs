//! The capability catalog.
//!
//! A fixed, process-wide registry mapping every [`CapabilityKind`] to the
//! [`RestrictionValueKind`] used to configure it. Callers enumerate it to
//! discover what can be restricted before assembling a
//! [`RestrictionPolicy`](crate::policy::RestrictionPolicy).

use crate::capability::{CapabilityKind, RestrictionValueKind};
use std::sync::OnceLock;

const ENTRIES: [(CapabilityKind, RestrictionValueKind); 18] = [
    (CapabilityKind::Security, RestrictionValueKind::SecurityFlags),
    (CapabilityKind::FileIo, RestrictionValueKind::GrantState),
    (CapabilityKind::Web, RestrictionValueKind::GrantState),
    (CapabilityKind::Reflection, RestrictionValueKind::ReflectionFlags),
    (CapabilityKind::Registry, RestrictionValueKind::GrantState),
    (CapabilityKind::GacIdentity, RestrictionValueKind::GrantState),
    (CapabilityKind::Environment, RestrictionValueKind::GrantState),
    (CapabilityKind::IsolatedStorage, RestrictionValueKind::GrantState),
    (CapabilityKind::KeyContainer, RestrictionValueKind::KeyContainerFlags),
    (CapabilityKind::Principal, RestrictionValueKind::GrantState),
    (CapabilityKind::SiteIdentity, RestrictionValueKind::GrantState),
    (CapabilityKind::PublisherIdentity, RestrictionValueKind::GrantState),
    (CapabilityKind::Store, RestrictionValueKind::StoreFlags),
    (CapabilityKind::StrongNameIdentity, RestrictionValueKind::GrantState),
    (CapabilityKind::TypeDescriptor, RestrictionValueKind::TypeDescriptorFlags),
    (CapabilityKind::Ui, RestrictionValueKind::GrantState),
    (CapabilityKind::UrlIdentity, RestrictionValueKind::GrantState),
    (CapabilityKind::ZoneIdentity, RestrictionValueKind::SecurityZone),
];

static GLOBAL: OnceLock<CapabilityCatalog> = OnceLock::new();

/// Immutable capability catalog.
#[derive(Debug)]
pub struct CapabilityCatalog {
    entries: &'static [(CapabilityKind, RestrictionValueKind)],
}

impl CapabilityCatalog {
    /// The process-wide catalog, initialized on first use.
    pub fn global() -> &'static CapabilityCatalog {
        GLOBAL.get_or_init(|| CapabilityCatalog { entries: &ENTRIES })
    }

    /// All capability kinds with their value kinds, in catalog order.
    pub fn enumerate(&self) -> &[(CapabilityKind, RestrictionValueKind)] {
        self.entries
    }

    /// Value kind used to configure `kind`.
    pub fn value_kind(&self, kind: CapabilityKind) -> RestrictionValueKind {
        self.entries
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| *v)
            // Unreachable: every kind has an entry.
            .unwrap_or(RestrictionValueKind::GrantState)
    }

    /// Iterate the capability kinds only.
    pub fn kinds(&self) -> impl Iterator<Item = CapabilityKind> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    /// Get the number of capability kinds.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_every_kind_has_one_entry() {
        let catalog = CapabilityCatalog::global();
        let kinds: HashSet<_> = catalog.kinds().collect();
        assert_eq!(kinds.len(), catalog.len());
        assert_eq!(catalog.len(), 18);

        for (kind, _) in catalog.enumerate() {
            // Round-trips through its name, so the catalog covers parseable kinds only.
            assert_eq!(CapabilityKind::parse(kind.as_str()).unwrap(), *kind);
        }
    }

    #[test]
    fn test_value_kinds() {
        let catalog = CapabilityCatalog::global();
        assert_eq!(
            catalog.value_kind(CapabilityKind::FileIo),
            RestrictionValueKind::GrantState
        );
        assert_eq!(
            catalog.value_kind(CapabilityKind::Reflection),
            RestrictionValueKind::ReflectionFlags
        );
        assert_eq!(
            catalog.value_kind(CapabilityKind::ZoneIdentity),
            RestrictionValueKind::SecurityZone
        );
    }

    #[test]
    fn test_global_is_shared() {
        let a = CapabilityCatalog::global() as *const _;
        let b = CapabilityCatalog::global() as *const _;
        assert_eq!(a, b);
    }
}
