//! Weighted random choice of the primary upstream.
//!
//! Every call draws independently: there is no round-robin cursor and no
//! feedback from earlier failures.

use tracing::error;

use crate::provider::{Provider, ProviderRegistry};

/// Source of uniformly distributed draws.
pub trait RandomSource: Send + Sync {
    /// Uniform value in `[0, bound)`. `bound` is always positive.
    fn below(&self, bound: u64) -> u64;
}

/// Thread-local generator backed by `fastrand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn below(&self, bound: u64) -> u64 {
        fastrand::u64(..bound)
    }
}

pub struct WeightedSelector {
    source: Box<dyn RandomSource>,
}

impl WeightedSelector {
    pub fn new() -> Self {
        Self::with_source(ThreadRandom)
    }

    pub fn with_source(source: impl RandomSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    /// Pick one provider with probability `weight / total_weight`.
    pub fn select<'a>(&self, registry: &'a ProviderRegistry) -> &'a Provider {
        let draw = self.source.below(registry.total_weight());
        pick(registry, draw)
    }
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeightedSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedSelector").finish_non_exhaustive()
    }
}

/// Map a draw in `[0, total_weight)` onto the provider whose cumulative
/// weight interval contains it.
pub fn pick(registry: &ProviderRegistry, draw: u64) -> &Provider {
    let mut remainder = draw;
    for provider in registry.providers() {
        let weight = u64::from(provider.weight);
        if remainder < weight {
            return provider;
        }
        remainder -= weight;
    }

    // Unreachable while draw < total_weight.
    error!(
        draw,
        total_weight = registry.total_weight(),
        "Weighted selection ran past the last provider; using the first"
    );
    registry.first()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn example_registry() -> ProviderRegistry {
        ProviderRegistry::new(vec![
            Provider::new("A", "https://a.example/dns-query", 20),
            Provider::new("B", "https://b.example/dns-query", 15),
            Provider::new("C", "https://c.example/dns-query", 15),
            Provider::new("D", "https://d.example/dns-query", 10),
        ])
        .expect("valid registry")
    }

    struct Seeded(Mutex<fastrand::Rng>);

    impl RandomSource for Seeded {
        fn below(&self, bound: u64) -> u64 {
            self.0.lock().expect("rng lock").u64(..bound)
        }
    }

    struct Fixed(u64);

    impl RandomSource for Fixed {
        fn below(&self, _bound: u64) -> u64 {
            self.0
        }
    }

    #[test]
    fn draws_map_onto_cumulative_intervals() {
        let registry = example_registry();
        assert_eq!(pick(&registry, 0).name, "A");
        assert_eq!(pick(&registry, 18).name, "A");
        assert_eq!(pick(&registry, 19).name, "A");
        assert_eq!(pick(&registry, 20).name, "B");
        assert_eq!(pick(&registry, 25).name, "B");
        assert_eq!(pick(&registry, 42).name, "C");
        assert_eq!(pick(&registry, 50).name, "D");
        assert_eq!(pick(&registry, 59).name, "D");
    }

    #[test]
    fn out_of_range_draw_falls_back_to_first() {
        let registry = example_registry();
        assert_eq!(pick(&registry, 60).name, "A");
    }

    #[test]
    fn selector_uses_its_random_source() {
        let registry = example_registry();
        let selector = WeightedSelector::with_source(Fixed(42));
        assert_eq!(selector.select(&registry).name, "C");
    }

    #[test]
    fn thread_random_always_returns_a_registered_provider() {
        let registry = example_registry();
        let selector = WeightedSelector::new();
        for _ in 0..1_000 {
            let chosen = selector.select(&registry);
            assert!(registry.get(&chosen.name).is_some());
        }
    }

    #[test]
    fn empirical_frequencies_converge_to_weights() {
        let registry = example_registry();
        let selector =
            WeightedSelector::with_source(Seeded(Mutex::new(fastrand::Rng::with_seed(0x5eed))));
        let rounds = 200_000;
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..rounds {
            *counts
                .entry(selector.select(&registry).name.clone())
                .or_default() += 1;
        }

        let total = registry.total_weight() as f64;
        for provider in registry.providers() {
            let expected = f64::from(provider.weight) / total;
            let observed = f64::from(counts[&provider.name]) / f64::from(rounds);
            assert!(
                (observed - expected).abs() < 0.01,
                "{}: expected {expected:.3}, observed {observed:.3}",
                provider.name
            );
        }
    }

    #[test]
    fn single_provider_is_always_chosen() {
        let registry =
            ProviderRegistry::new(vec![Provider::new("solo", "https://solo.example/q", 3)])
                .expect("valid registry");
        let selector = WeightedSelector::new();
        for _ in 0..100 {
            assert_eq!(selector.select(&registry).name, "solo");
        }
    }
}
