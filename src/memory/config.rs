use super::error::AllocError;

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * KIB;

/// Smallest size class. Also the size of the intrusive link word a free
/// slot carries, so no class can be smaller.
pub const MIN_CLASS_SIZE: usize = 8;

/// Configuration for [`TieredAllocator`](super::tiered::TieredAllocator).
/// All fields have sensible defaults. Set at construction time via
/// `TieredAllocator::new(config)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Commit granularity of the size-class tier: one pool per page.
    /// Default: 4 KiB.
    pub page_size: usize,

    /// Largest request served by the size-class tier. Must be a power of two
    /// between 8 and `page_size`. Default: 512 B.
    pub small_ceiling: usize,

    /// Largest request served by the coalescing tier. Anything above goes to
    /// the large-object tier. Default: 10 MiB.
    pub coalesce_ceiling: usize,

    /// Committed size of each coalescing arena. Default: 10 MiB.
    pub arena_size: usize,

    /// Total address space reserved up front. Also the byte budget shared by
    /// every tier, large objects included. Default: 100 MiB.
    pub reservation_size: usize,

    /// Payload alignment of the coalescing and large tiers. Size-class slots
    /// are naturally aligned to their class. Default: 8 B.
    pub alignment: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: 4 * KIB,
            small_ceiling: 512,
            coalesce_ceiling: 10 * MIB,
            arena_size: 10 * MIB,
            reservation_size: 100 * MIB,
            alignment: 8,
        }
    }
}

impl AllocatorConfig {
    /// Smallest size class. Classes below `alignment` would hand out
    /// misaligned slots, so they are not built.
    #[must_use]
    pub fn min_class_size(&self) -> usize {
        MIN_CLASS_SIZE.max(self.alignment)
    }

    /// Number of size classes: `min_class_size()`, doubling up to
    /// `small_ceiling`.
    #[must_use]
    pub fn size_class_count(&self) -> usize {
        (self.small_ceiling.trailing_zeros() - self.min_class_size().trailing_zeros()) as usize + 1
    }

    /// Bytes committed by `init`: one page per size class plus the first arena.
    #[must_use]
    pub fn initial_footprint(&self) -> usize {
        self.size_class_count() * self.page_size + self.arena_size
    }

    /// Check the invariants the tiers rely on.
    ///
    /// # Errors
    ///
    /// Returns `AllocError::InvalidConfig` naming the first violated rule.
    pub fn validate(&self) -> Result<(), AllocError> {
        fn invalid(msg: String) -> Result<(), AllocError> {
            Err(AllocError::InvalidConfig(msg))
        }

        if !self.page_size.is_power_of_two() {
            return invalid(format!("page_size {} is not a power of two", self.page_size));
        }
        if !self.small_ceiling.is_power_of_two()
            || self.small_ceiling < MIN_CLASS_SIZE
            || self.small_ceiling > self.page_size
        {
            return invalid(format!(
                "small_ceiling {} must be a power of two in [{MIN_CLASS_SIZE}, page_size {}]",
                self.small_ceiling, self.page_size
            ));
        }
        if !self.alignment.is_power_of_two() || self.alignment > self.page_size {
            return invalid(format!(
                "alignment {} must be a power of two no larger than page_size {}",
                self.alignment, self.page_size
            ));
        }
        if self.alignment > self.small_ceiling {
            return invalid(format!(
                "alignment {} must not exceed small_ceiling {}",
                self.alignment, self.small_ceiling
            ));
        }
        if self.coalesce_ceiling <= self.small_ceiling {
            return invalid(format!(
                "coalesce_ceiling {} must exceed small_ceiling {}",
                self.coalesce_ceiling, self.small_ceiling
            ));
        }
        if self.arena_size == 0 || !self.arena_size.is_multiple_of(self.page_size) {
            return invalid(format!(
                "arena_size {} must be a non-zero multiple of page_size {}",
                self.arena_size, self.page_size
            ));
        }
        if !self.reservation_size.is_multiple_of(self.page_size) {
            return invalid(format!(
                "reservation_size {} must be a multiple of page_size {}",
                self.reservation_size, self.page_size
            ));
        }
        if self.initial_footprint() > self.reservation_size {
            return invalid(format!(
                "reservation_size {} cannot hold the initial footprint of {} bytes",
                self.reservation_size,
                self.initial_footprint()
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AllocatorConfig::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.size_class_count(), 7); // 8..=512
        assert_eq!(config.initial_footprint(), 7 * 4096 + 10 * MIB);
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        let config = AllocatorConfig {
            small_ceiling: 500,
            ..AllocatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(AllocError::InvalidConfig(_))));

        let config = AllocatorConfig {
            alignment: 12,
            ..AllocatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(AllocError::InvalidConfig(_))));
    }

    #[test]
    fn test_alignment_raises_smallest_class() {
        let config = AllocatorConfig {
            alignment: 64,
            ..AllocatorConfig::default()
        };
        config.validate().unwrap();
        assert_eq!(config.min_class_size(), 64);
        assert_eq!(config.size_class_count(), 4); // 64..=512
        assert_eq!(config.initial_footprint(), 4 * 4096 + 10 * MIB);

        let config = AllocatorConfig {
            alignment: 1024,
            ..AllocatorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("small_ceiling"), "{err}");
    }

    #[test]
    fn test_rejects_small_ceiling_above_page() {
        let config = AllocatorConfig {
            page_size: 4096,
            small_ceiling: 8192,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_reservation_smaller_than_footprint() {
        let config = AllocatorConfig {
            reservation_size: 10 * MIB,
            ..AllocatorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("initial footprint"), "{err}");
    }

    #[test]
    fn test_rejects_unaligned_arena() {
        let config = AllocatorConfig {
            arena_size: 10 * MIB + 1,
            ..AllocatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
