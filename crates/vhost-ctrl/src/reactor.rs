//! Core masks and the per-core load table used to place controllers on reactors.

use std::fmt;
use std::ops::BitAnd;

use tracing::debug;

use crate::error::VhostError;

/// Highest number of cores a [`CoreMask`] can describe.
pub const MAX_CORES: u32 = 64;

/// Core used when a requested mask shares nothing with the allowed set.
pub const DEFAULT_CORE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoreMask(u64);

impl CoreMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn single(core: u32) -> Self {
        if core < MAX_CORES {
            Self(1 << core)
        } else {
            Self::EMPTY
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, core: u32) -> bool {
        core < MAX_CORES && self.0 & (1 << core) != 0
    }

    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// Cores in the mask, lowest id first.
    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..MAX_CORES).filter(move |&core| self.contains(core))
    }
}

impl BitAnd for CoreMask {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Parses a hexadecimal core mask (optionally `0x`-prefixed).
///
/// The mask must select at least one core and only cores in `app_mask`.
pub fn parse_core_mask(text: &str, app_mask: CoreMask) -> Result<CoreMask, VhostError> {
    let invalid = |reason| VhostError::InvalidCoreMask {
        text: text.to_string(),
        reason,
    };

    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    if digits.is_empty() {
        return Err(invalid("empty"));
    }
    if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid("not a hexadecimal number"));
    }

    let bits = u64::from_str_radix(digits, 16).map_err(|_| invalid("does not fit in 64 bits"))?;
    let mask = CoreMask::from_bits(bits);
    if mask.is_empty() {
        return Err(invalid("selects no cores"));
    }
    if !mask.is_subset_of(app_mask) {
        return Err(invalid("selects cores outside the application mask"));
    }
    Ok(mask)
}

/// Number of controllers assigned to each core.
#[derive(Debug, Clone)]
pub struct LoadTable {
    counts: Vec<u32>,
}

impl Default for LoadTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadTable {
    pub fn new() -> Self {
        Self {
            counts: vec![0; MAX_CORES as usize],
        }
    }

    pub fn load(&self, core: u32) -> u32 {
        self.counts.get(core as usize).copied().unwrap_or(0)
    }

    /// Picks the least loaded core of `requested & allowed` and charges it one controller.
    ///
    /// Ties go to the lowest core id. An empty intersection yields [`DEFAULT_CORE`] without
    /// charging anything.
    pub fn allocate(&mut self, requested: CoreMask, allowed: CoreMask) -> u32 {
        let candidates = requested & allowed;

        let mut selected = None;
        for core in candidates.iter() {
            let load = self.counts[core as usize];
            match selected {
                Some((_, min)) if load >= min => {}
                _ => selected = Some((core, load)),
            }
        }

        let Some((core, _)) = selected else {
            debug!(%requested, %allowed, "no usable core in mask, falling back to core {DEFAULT_CORE}");
            return DEFAULT_CORE;
        };
        self.counts[core as usize] += 1;
        debug!(%candidates, core, load = self.counts[core as usize], "allocated reactor");
        core
    }

    /// Returns one controller's charge on `core`.
    pub fn free(&mut self, core: u32) {
        let Some(count) = self.counts.get_mut(core as usize) else {
            return;
        };
        debug_assert!(*count > 0, "freeing core {core} with no assigned controllers");
        *count = count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const ALL: CoreMask = CoreMask::from_bits(0b1111);

    #[test]
    fn least_loaded_then_lowest_id() {
        let mut loads = LoadTable::new();
        let mask = CoreMask::from_bits(0b1010);

        assert_eq!(loads.allocate(mask, ALL), 1);
        assert_eq!(loads.load(1), 1);
        assert_eq!(loads.allocate(mask, ALL), 3);
        assert_eq!(loads.load(3), 1);
        assert_eq!(loads.allocate(mask, ALL), 1);
        assert_eq!(loads.load(1), 2);
    }

    #[test]
    fn empty_intersection_falls_back_without_charging() {
        let mut loads = LoadTable::new();
        let core = loads.allocate(CoreMask::from_bits(0b1_0000), ALL);
        assert_eq!(core, DEFAULT_CORE);
        assert_eq!(loads.load(DEFAULT_CORE), 0);
    }

    #[test]
    fn free_returns_charge() {
        let mut loads = LoadTable::new();
        let core = loads.allocate(CoreMask::from_bits(0b100), ALL);
        assert_eq!(core, 2);
        loads.free(core);
        assert_eq!(loads.load(2), 0);
    }

    #[test]
    fn high_cores_are_reachable() {
        let mut loads = LoadTable::new();
        let top = CoreMask::single(63);
        assert_eq!(loads.allocate(top, CoreMask::from_bits(u64::MAX)), 63);
        assert!(CoreMask::single(64).is_empty());
    }

    #[test]
    fn parses_hex_masks() {
        let app = CoreMask::from_bits(0xff);
        assert_eq!(parse_core_mask("0x3", app).unwrap().bits(), 0x3);
        assert_eq!(parse_core_mask("F0", app).unwrap().bits(), 0xf0);
        assert_eq!(parse_core_mask(" 0X1 ", app).unwrap().bits(), 0x1);
    }

    #[test]
    fn rejects_bad_masks() {
        let app = CoreMask::from_bits(0xff);
        for text in ["", "0x", "0", "0x00", "12g", "-1", "+1", "0x100", "1_0000000000000000"] {
            let err = parse_core_mask(text, app).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{text:?}");
        }
        assert!(matches!(
            parse_core_mask("10000000000000000", app),
            Err(VhostError::InvalidCoreMask { reason: "does not fit in 64 bits", .. })
        ));
    }

    #[test]
    fn displays_as_hex() {
        assert_eq!(CoreMask::from_bits(0xa).to_string(), "0xa");
    }
}
