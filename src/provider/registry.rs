//! Process-wide table of provider backends.
//!
//! The table is built once on first use and read-only thereafter. Each
//! entry carries a help table describing the configuration keys the
//! backend understands, which the CLI prints for documentation.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use super::{boxcar, fake, Provider, ProviderConfig, ProviderError};

/// Constructor turning a configuration map into a ready provider.
pub type ProviderFactory = fn(&ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError>;

/// One registered backend.
pub struct ProviderRegistration {
    /// Stable name used in worker configuration.
    pub name: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Configuration keys and their descriptions.
    pub help: &'static [(&'static str, &'static str)],
    /// Factory producing the provider from its configuration.
    pub factory: ProviderFactory,
}

static REGISTRY: LazyLock<BTreeMap<&'static str, ProviderRegistration>> = LazyLock::new(|| {
    let mut table = BTreeMap::new();
    for registration in [boxcar::registration(), fake::registration()] {
        table.insert(registration.name, registration);
    }
    table
});

/// Looks up a backend by name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static ProviderRegistration> {
    REGISTRY.get(name)
}

/// Iterates all registered backends in name order.
pub fn registrations() -> impl Iterator<Item = &'static ProviderRegistration> {
    REGISTRY.values()
}

/// Builds a provider by registry name.
///
/// # Errors
///
/// Returns [`ProviderError::Unknown`] for unregistered names and any
/// factory error for known ones.
pub fn build(name: &str, config: &ProviderConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    let registration = lookup(name).ok_or_else(|| ProviderError::Unknown(name.to_owned()))?;
    (registration.factory)(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_backends_are_registered() {
        assert!(lookup("boxcar").is_some());
        assert!(lookup("fake").is_some());
        assert!(lookup("absent").is_none());
    }

    #[test]
    fn build_rejects_unknown_names() {
        let err = build("absent", &ProviderConfig::default()).expect_err("unknown backend");
        assert!(matches!(err, ProviderError::Unknown(name) if name == "absent"));
    }

    #[test]
    fn help_tables_name_required_keys() {
        let registration = lookup("boxcar").unwrap_or_else(|| panic!("boxcar not registered"));
        let keys: Vec<&str> = registration.help.iter().map(|(key, _)| *key).collect();
        assert!(keys.contains(&"ENDPOINT"));
        assert!(keys.contains(&"IMAGE_ALIASES"));
    }
}
