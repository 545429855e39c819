//! Routing of type tokens to providers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::ProviderError;

use super::traits::Provider;

/// Returns the package of a type or function token (`azure-native` for
/// `azure-native:storage:StorageAccount`).
#[must_use]
pub fn package_of(token: &str) -> &str {
    token.split(':').next().unwrap_or(token)
}

/// Providers keyed by package, with an optional fallback.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut packages: Vec<_> = self.providers.keys().collect();
        packages.sort();
        f.debug_struct("ProviderRegistry")
            .field("packages", &packages)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry that routes every token to one provider.
    #[must_use]
    pub fn single(provider: Arc<dyn Provider>) -> Self {
        Self::new().with_fallback(provider)
    }

    /// Registers a provider for a package, builder style.
    #[must_use]
    pub fn with_provider(mut self, package: &str, provider: Arc<dyn Provider>) -> Self {
        self.register(package, provider);
        self
    }

    /// Sets the provider used for packages without a dedicated one.
    #[must_use]
    pub fn with_fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    /// Registers a provider for a package.
    pub fn register(&mut self, package: &str, provider: Arc<dyn Provider>) {
        self.providers.insert(package.to_string(), provider);
    }

    /// Finds the provider responsible for a token.
    ///
    /// # Errors
    ///
    /// Returns `NoProvider` if neither a package provider nor a fallback exists.
    pub fn resolve(&self, token: &str) -> Result<Arc<dyn Provider>, ProviderError> {
        self.providers
            .get(package_of(token))
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ProviderError::NoProvider {
                type_token: token.to_string(),
            })
    }

    /// Packages with a dedicated provider.
    #[must_use]
    pub fn packages(&self) -> Vec<&str> {
        let mut packages: Vec<_> = self.providers.keys().map(String::as_str).collect();
        packages.sort_unstable();
        packages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::InMemoryProvider;

    #[test]
    fn test_package_of() {
        assert_eq!(package_of("azure-native:storage:StorageAccount"), "azure-native");
        assert_eq!(package_of("docker:index:Image"), "docker");
        assert_eq!(package_of("plain"), "plain");
    }

    #[test]
    fn test_resolve_routes_by_package() {
        let registry = ProviderRegistry::new()
            .with_provider("docker", Arc::new(InMemoryProvider::new()));

        assert!(registry.resolve("docker:index:Image").is_ok());
        assert!(matches!(
            registry.resolve("azure-native:resources:ResourceGroup"),
            Err(ProviderError::NoProvider { .. })
        ));

        let registry = registry.with_fallback(Arc::new(InMemoryProvider::new()));
        assert!(registry.resolve("azure-native:resources:ResourceGroup").is_ok());
        assert_eq!(registry.packages(), vec!["docker"]);
    }
}
