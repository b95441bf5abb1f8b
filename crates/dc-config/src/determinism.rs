use rand::{rngs::StdRng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Process-wide seeding policy for parameter initialisation.
#[derive(Clone, Debug)]
pub struct DeterminismConfig {
    /// Whether deterministic seeding is enabled globally.
    pub enabled: bool,
    /// Base seed used to derive per-layer seeds.
    pub base_seed: u64,
    /// If true GEMM reductions run on a single rayon thread.
    pub fix_reduction: bool,
}

impl DeterminismConfig {
    fn from_env() -> Self {
        let enabled = std::env::var("DCNET_DETERMINISTIC")
            .ok()
            .map(|v| !matches!(v.as_str(), "0" | "false" | "False" | "off" | "OFF"))
            .unwrap_or(false);

        let base_seed = std::env::var("DCNET_DETERMINISTIC_SEED")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(42);

        let fix_reduction = std::env::var("DCNET_DETERMINISTIC_REDUCTION")
            .ok()
            .map(|v| matches!(v.as_str(), "1" | "true" | "True" | "on" | "ON"))
            .unwrap_or(enabled);

        Self {
            enabled,
            base_seed,
            fix_reduction,
        }
    }

    /// Derives a deterministic seed for a given label.
    pub fn seed_for<L: Hash>(&self, label: L) -> u64 {
        derive_seed(self.base_seed, label)
    }
}

/// Mixes `base` with `label` so every named layer draws its own stream.
pub fn derive_seed<L: Hash>(base: u64, label: L) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

/// Seed for a named layer: mixed from `seed` when given, otherwise from the
/// global policy when determinism is enabled, otherwise `None` (entropy).
pub fn layer_seed(seed: Option<u64>, label: &str) -> Option<u64> {
    match seed {
        Some(base) => Some(derive_seed(base, label)),
        None => {
            let cfg = config();
            cfg.enabled.then(|| cfg.seed_for(label))
        }
    }
}

static CONFIG: OnceLock<DeterminismConfig> = OnceLock::new();

/// Returns the lazily initialised configuration.
pub fn config() -> &'static DeterminismConfig {
    CONFIG.get_or_init(|| {
        let cfg = DeterminismConfig::from_env();
        apply_process_hints(&cfg);
        cfg
    })
}

fn apply_process_hints(cfg: &DeterminismConfig) {
    if cfg.enabled && cfg.fix_reduction {
        // Only effective before the global rayon pool is built.
        std::env::set_var("RAYON_NUM_THREADS", "1");
    }
}

/// Returns a RNG derived from `label`, or an entropy-seeded one when
/// determinism is disabled.
pub fn rng_from_label(label: &str) -> StdRng {
    let cfg = config();
    if cfg.enabled {
        StdRng::seed_from_u64(cfg.seed_for(label))
    } else {
        StdRng::from_entropy()
    }
}

/// Returns a RNG seeded from an explicit seed when given, falling back to
/// [`rng_from_label`].
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => rng_from_label(label),
    }
}
