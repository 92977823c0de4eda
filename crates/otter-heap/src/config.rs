//! Heap configuration

use crate::error::{GcError, GcResult};
use std::time::Duration;

/// Which write barrier the heap installs while marking is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierMode {
    /// Snapshot-at-the-beginning: gray the overwritten referent
    Satb,
    /// Dijkstra insertion: gray a white referent stored into a black object
    IncrementalUpdate,
    /// Both of the above
    #[default]
    Hybrid,
}

/// Tunables of the adaptive split-versus-bump decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptivePolicy {
    /// Weight of the newest sample in the demand and count averages (0, 1]
    pub demand_weight: f64,
    /// A class whose average count stays below this is treated as starved
    /// and served by splitting larger chunks first
    pub starvation_threshold: f64,
}

impl Default for AdaptivePolicy {
    fn default() -> Self {
        Self {
            demand_weight: 0.25,
            starvation_threshold: 0.5,
        }
    }
}

/// Heap and collector configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Region size in bytes, a power of two (default: 256KB)
    pub region_size: usize,
    /// Regions committed when the heap is created (default: 16)
    pub initial_regions: usize,
    /// Regions in the reserved address range (default: 256)
    pub max_regions: usize,
    /// Eden region budget (default: 8)
    pub eden_regions: usize,
    /// Survivor region budget (default: 2)
    pub survivor_regions: usize,
    /// Minor collections an object survives before promotion (default: 6, max 15)
    pub tenuring_threshold: u8,
    /// Requests larger than this go straight to the old generation (default: half a region)
    pub pretenure_threshold: usize,
    /// Old occupancy percentage that starts a concurrent cycle (default: 45)
    pub initiating_occupancy_percent: u8,
    /// Fragmentation index above which a major collection compacts (default: 0.9)
    pub compaction_fragmentation_threshold: f64,
    /// Upper bound on parallel marking workers (default: 4)
    pub max_gc_workers: usize,
    /// Scale marking workers with the number of mutators (default: true)
    pub dynamic_gc_workers: bool,
    /// How long a safepoint request waits for mutators; `None` waits forever (default: 10s)
    pub safepoint_timeout: Option<Duration>,
    /// Barrier flavor used during concurrent marking
    pub barrier_mode: BarrierMode,
    /// Check the black-to-white invariant after final mark (default: on in debug builds)
    pub verify_marking: bool,
    /// Start the background concurrent mark thread with the heap (default: false)
    pub background_marking: bool,
    /// Adaptive free-list policy
    pub adaptive: AdaptivePolicy,
}

impl Default for GcConfig {
    fn default() -> Self {
        let region_size = 256 * 1024; // 256KB
        Self {
            region_size,
            initial_regions: 16,
            max_regions: 256, // 64MB reserved
            eden_regions: 8,
            survivor_regions: 2,
            tenuring_threshold: 6,
            pretenure_threshold: region_size / 2,
            initiating_occupancy_percent: 45,
            compaction_fragmentation_threshold: 0.9,
            max_gc_workers: 4,
            dynamic_gc_workers: true,
            safepoint_timeout: Some(Duration::from_secs(10)),
            barrier_mode: BarrierMode::Hybrid,
            verify_marking: cfg!(debug_assertions),
            background_marking: false,
            adaptive: AdaptivePolicy::default(),
        }
    }
}

impl GcConfig {
    /// A small heap for tests and embedding: 16KB regions, 4 eden regions
    pub fn small() -> Self {
        let region_size = 16 * 1024;
        Self {
            region_size,
            initial_regions: 4,
            max_regions: 64,
            eden_regions: 4,
            survivor_regions: 2,
            pretenure_threshold: region_size / 2,
            max_gc_workers: 2,
            safepoint_timeout: Some(Duration::from_secs(5)),
            verify_marking: true,
            ..Self::default()
        }
    }

    /// Set the region size; the pretenure threshold follows at half a region
    pub fn with_region_size(mut self, bytes: usize) -> Self {
        self.region_size = bytes;
        self.pretenure_threshold = bytes / 2;
        self
    }

    /// Set the reserved range in regions
    pub fn with_max_regions(mut self, regions: usize) -> Self {
        self.max_regions = regions;
        self
    }

    /// Set eden and survivor budgets
    pub fn with_young_regions(mut self, eden: usize, survivor: usize) -> Self {
        self.eden_regions = eden;
        self.survivor_regions = survivor;
        self
    }

    /// Set the tenuring threshold
    pub fn with_tenuring_threshold(mut self, threshold: u8) -> Self {
        self.tenuring_threshold = threshold;
        self
    }

    /// Set the barrier flavor
    pub fn with_barrier_mode(mut self, mode: BarrierMode) -> Self {
        self.barrier_mode = mode;
        self
    }

    /// Set the safepoint timeout
    pub fn with_safepoint_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.safepoint_timeout = timeout;
        self
    }

    /// Set the marking worker bound
    pub fn with_gc_workers(mut self, max: usize, dynamic: bool) -> Self {
        self.max_gc_workers = max;
        self.dynamic_gc_workers = dynamic;
        self
    }

    /// Enable or disable the background concurrent mark thread
    pub fn with_background_marking(mut self, enabled: bool) -> Self {
        self.background_marking = enabled;
        self
    }

    /// Set the fragmentation index that forces compaction
    pub fn with_compaction_threshold(mut self, threshold: f64) -> Self {
        self.compaction_fragmentation_threshold = threshold;
        self
    }

    /// Bytes in the reserved range
    pub fn reserved_bytes(&self) -> usize {
        self.region_size * self.max_regions
    }

    /// Reject out-of-range values
    pub fn validate(&self) -> GcResult<()> {
        let invalid = |msg: String| Err(GcError::InvalidConfig(msg));

        if !self.region_size.is_power_of_two() || self.region_size < 4096 {
            return invalid(format!(
                "region_size must be a power of two of at least 4096, got {}",
                self.region_size
            ));
        }
        if self.region_size > u32::MAX as usize {
            return invalid(format!("region_size {} exceeds 4GB", self.region_size));
        }
        if self.max_regions == 0 || self.initial_regions > self.max_regions {
            return invalid(format!(
                "initial_regions ({}) must not exceed max_regions ({}) and max_regions must be > 0",
                self.initial_regions, self.max_regions
            ));
        }
        if self.eden_regions == 0 || self.survivor_regions == 0 {
            return invalid("eden_regions and survivor_regions must be > 0".into());
        }
        if self.eden_regions + self.survivor_regions >= self.max_regions {
            return invalid(format!(
                "young budget ({} regions) leaves no room for the old generation in {} regions",
                self.eden_regions + self.survivor_regions,
                self.max_regions
            ));
        }
        if self.tenuring_threshold > 15 {
            return invalid(format!(
                "tenuring_threshold must be in 0..=15, got {}",
                self.tenuring_threshold
            ));
        }
        if self.pretenure_threshold == 0 || self.pretenure_threshold > self.region_size {
            return invalid(format!(
                "pretenure_threshold must be in 1..={}, got {}",
                self.region_size, self.pretenure_threshold
            ));
        }
        if self.initiating_occupancy_percent > 100 {
            return invalid(format!(
                "initiating_occupancy_percent must be in 0..=100, got {}",
                self.initiating_occupancy_percent
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_fragmentation_threshold) {
            return invalid(format!(
                "compaction_fragmentation_threshold must be in 0.0..=1.0, got {}",
                self.compaction_fragmentation_threshold
            ));
        }
        if self.max_gc_workers == 0 {
            return invalid("max_gc_workers must be > 0".into());
        }
        let weight = self.adaptive.demand_weight;
        if !(weight > 0.0 && weight <= 1.0) {
            return invalid(format!("adaptive.demand_weight must be in (0, 1], got {weight}"));
        }
        if self.adaptive.starvation_threshold < 0.0 {
            return invalid("adaptive.starvation_threshold must be >= 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(GcConfig::default().validate().is_ok());
        assert!(GcConfig::small().validate().is_ok());
        assert_eq!(GcConfig::default().barrier_mode, BarrierMode::Hybrid);
    }

    #[test]
    fn test_rejects_bad_values() {
        let config = GcConfig::small().with_tenuring_threshold(16);
        assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))));

        let config = GcConfig::small().with_region_size(5000);
        assert!(config.validate().is_err());

        let mut config = GcConfig::small();
        config.initiating_occupancy_percent = 101;
        assert!(config.validate().is_err());

        let config = GcConfig::small().with_young_regions(40, 30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_region_size_moves_pretenure_threshold() {
        let config = GcConfig::small().with_region_size(64 * 1024);
        assert_eq!(config.pretenure_threshold, 32 * 1024);
        assert_eq!(config.reserved_bytes(), 64 * 1024 * 64);
    }
}
