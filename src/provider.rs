use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Static description of a built-in upstream resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinProvider {
    pub name: &'static str,
    pub url: &'static str,
    pub weight: u32,
    pub description: &'static str,
}

const BUILTIN_PROVIDERS: &[BuiltinProvider] = &[
    BuiltinProvider {
        name: "cloudflare",
        url: "https://cloudflare-dns.com/dns-query",
        weight: 20,
        description: "Cloudflare (1.1.1.1)",
    },
    BuiltinProvider {
        name: "google",
        url: "https://dns.google/dns-query",
        weight: 15,
        description: "Google Public DNS",
    },
    BuiltinProvider {
        name: "quad9",
        url: "https://dns.quad9.net/dns-query",
        weight: 15,
        description: "Quad9 (threat blocking)",
    },
    BuiltinProvider {
        name: "adguard",
        url: "https://dns.adguard-dns.com/dns-query",
        weight: 10,
        description: "AdGuard DNS",
    },
    BuiltinProvider {
        name: "opendns",
        url: "https://doh.opendns.com/dns-query",
        weight: 10,
        description: "Cisco OpenDNS",
    },
    BuiltinProvider {
        name: "mullvad",
        url: "https://doh.mullvad.net/dns-query",
        weight: 10,
        description: "Mullvad Privacy DNS",
    },
    BuiltinProvider {
        name: "controld",
        url: "https://freedns.controld.com/p0",
        weight: 10,
        description: "Control D (unfiltered)",
    },
    BuiltinProvider {
        name: "nextdns",
        url: "https://dns.nextdns.io/dns-query",
        weight: 10,
        description: "NextDNS (anonymous)",
    },
];

/// Built-in provider table used when the configuration does not list any.
pub fn builtin_providers() -> &'static [BuiltinProvider] {
    BUILTIN_PROVIDERS
}

/// One upstream DoH endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub url: String,
    pub weight: u32,
}

impl Provider {
    pub fn new(name: impl Into<String>, url: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            weight,
        }
    }

    /// Whether the endpoint is reached over plain HTTP.
    pub fn is_insecure(&self) -> bool {
        self.url
            .get(..7)
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
    }
}

impl From<&BuiltinProvider> for Provider {
    fn from(builtin: &BuiltinProvider) -> Self {
        Provider::new(builtin.name, builtin.url, builtin.weight)
    }
}

/// Reasons a provider list cannot be used. Fatal at startup.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("provider registry is empty")]
    Empty,
    #[error("provider '{name}' has a weight of zero")]
    ZeroWeight { name: String },
    #[error("provider name '{name}' is listed more than once")]
    DuplicateName { name: String },
    #[error("provider '{name}' has an invalid URL '{url}': {reason}")]
    InvalidUrl {
        name: String,
        url: String,
        reason: String,
    },
}

/// Ordered, validated, read-only set of upstream providers.
///
/// The registry is never empty, every weight is positive and names are unique.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    total_weight: u64,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>) -> Result<Self, RegistryError> {
        if providers.is_empty() {
            return Err(RegistryError::Empty);
        }

        let mut seen = HashSet::new();
        for provider in &providers {
            if provider.weight == 0 {
                return Err(RegistryError::ZeroWeight {
                    name: provider.name.clone(),
                });
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(RegistryError::DuplicateName {
                    name: provider.name.clone(),
                });
            }
            validate_url(provider)?;
        }

        let total_weight = providers.iter().map(|p| u64::from(p.weight)).sum();
        Ok(Self {
            providers,
            total_weight,
        })
    }

    /// Registry built from the built-in provider table.
    pub fn builtin() -> Self {
        let providers = BUILTIN_PROVIDERS.iter().map(Provider::from).collect();
        Self::new(providers).expect("built-in provider table must be valid")
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn first(&self) -> &Provider {
        &self.providers[0]
    }

    pub fn get(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|provider| provider.name == name)
    }

    /// Every provider except `excluded`, in registry order. No weighting.
    pub fn fallback_candidates<'a>(
        &'a self,
        excluded: &'a str,
    ) -> impl Iterator<Item = &'a Provider> + 'a {
        self.providers
            .iter()
            .filter(move |provider| provider.name != excluded)
    }
}

fn validate_url(provider: &Provider) -> Result<(), RegistryError> {
    let invalid = |reason: String| RegistryError::InvalidUrl {
        name: provider.name.clone(),
        url: provider.url.clone(),
        reason,
    };

    let parsed = Url::parse(&provider.url).map_err(|err| invalid(err.to_string()))?;
    match parsed.scheme() {
        "https" | "http" => {}
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid(
            "query strings and fragments are appended per request".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eight_providers() -> ProviderRegistry {
        let providers = (0..8)
            .map(|idx| {
                Provider::new(
                    format!("p{idx}"),
                    format!("https://p{idx}.example/dns-query"),
                    idx + 1,
                )
            })
            .collect();
        ProviderRegistry::new(providers).expect("valid registry")
    }

    #[test]
    fn builtin_registry_is_valid() {
        let registry = ProviderRegistry::builtin();
        assert_eq!(registry.len(), 8);
        assert_eq!(registry.first().name, "cloudflare");
        assert_eq!(registry.total_weight(), 100);
    }

    #[test]
    fn empty_registry_is_rejected() {
        assert_eq!(
            ProviderRegistry::new(Vec::new()).unwrap_err(),
            RegistryError::Empty
        );
    }

    #[test]
    fn zero_weight_is_rejected() {
        let err = ProviderRegistry::new(vec![
            Provider::new("a", "https://a.example/dns-query", 5),
            Provider::new("b", "https://b.example/dns-query", 0),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::ZeroWeight { name: "b".into() });
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ProviderRegistry::new(vec![
            Provider::new("a", "https://a.example/dns-query", 5),
            Provider::new("a", "https://other.example/dns-query", 5),
        ])
        .unwrap_err();
        assert_eq!(err, RegistryError::DuplicateName { name: "a".into() });
    }

    #[test]
    fn urls_must_be_absolute_http_endpoints() {
        for url in [
            "not a url",
            "ftp://a.example/dns-query",
            "https://a.example/dns-query?dns=x",
        ] {
            let err = ProviderRegistry::new(vec![Provider::new("a", url, 1)]).unwrap_err();
            assert!(
                matches!(err, RegistryError::InvalidUrl { .. }),
                "{url} accepted"
            );
        }
    }

    #[test]
    fn plain_http_is_flagged_insecure() {
        assert!(Provider::new("a", "http://127.0.0.1:8080/dns-query", 1).is_insecure());
        assert!(!Provider::new("a", "https://a.example/dns-query", 1).is_insecure());
    }

    #[test]
    fn fallback_candidates_exclude_failed_provider_in_order() {
        let registry = eight_providers();
        let names: Vec<_> = registry
            .fallback_candidates("p3")
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, ["p0", "p1", "p2", "p4", "p5", "p6", "p7"]);
    }

    #[test]
    fn fallback_candidates_with_unknown_exclusion_keep_everything() {
        let registry = eight_providers();
        assert_eq!(registry.fallback_candidates("missing").count(), 8);
    }
}
