// Take a look at the license at the top of the repository in the LICENSE file.

//! The filter surface around the registry.
//!
//! Outward it exports a single predicate, [`is_listed`]: the scan pipeline
//! asks it for every enumerated device and discards the ones the registry
//! did not match. Inward it declares the contract of the caller's filter
//! chain, which the rename search consults to narrow its candidate set.

use crate::devcache::DeviceCache;

/// Named stages of the caller's filter chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    /// Device is present in sysfs and usable at all.
    Sysfs,
    /// Device type is acceptable (no cd-roms and the like).
    Type,
    /// Device is usable (not suspended, not an open dm mirror leg).
    Usable,
    /// Device is not a multipath component.
    Mpath,
    /// Whole disk is not partitioned over.
    Partitioned,
    /// No foreign signature occupies the device.
    Signature,
    /// Device is not an MD component.
    Md,
    /// Device is not a firmware-raid component.
    Fwraid,
    /// Persistent filter from the caller's configuration.
    Persistent,
}

impl FilterStage {
    /// Stage name as the caller's configuration spells it.
    pub fn name(self) -> &'static str {
        match self {
            FilterStage::Sysfs => "sysfs",
            FilterStage::Type => "type",
            FilterStage::Usable => "usable",
            FilterStage::Mpath => "mpath",
            FilterStage::Partitioned => "partitioned",
            FilterStage::Signature => "signature",
            FilterStage::Md => "md",
            FilterStage::Fwraid => "fwraid",
            FilterStage::Persistent => "persistent",
        }
    }
}

/// The stages a rename-search candidate must pass. Restricted to checks
/// that work from sysfs alone; the search itself does the only device read.
pub(crate) const RENAME_SEARCH_STAGES: &[FilterStage] = &[
    FilterStage::Sysfs,
    FilterStage::Type,
    FilterStage::Usable,
    FilterStage::Mpath,
    FilterStage::Partitioned,
];

/// Contract of the caller's filter chain, applied by named stage.
pub trait FilterChain {
    /// Whether the device passes one stage.
    fn pass(&mut self, cache: &DeviceCache, dev_idx: usize, stage: FilterStage) -> bool;

    /// Whether the device passes every listed stage.
    fn pass_all(&mut self, cache: &DeviceCache, dev_idx: usize, stages: &[FilterStage]) -> bool {
        stages.iter().all(|&s| self.pass(cache, dev_idx, s))
    }
}

/// A filter chain that rejects nothing. The default for callers without
/// their own chain, and for tests.
pub struct AcceptAll;

impl FilterChain for AcceptAll {
    fn pass(&mut self, _cache: &DeviceCache, _dev_idx: usize, _stage: FilterStage) -> bool {
        true
    }
}

/// The identity filter: true iff the device was matched to a registry
/// entry. Everything the scan pipeline does downstream keys off this.
pub fn is_listed(cache: &DeviceCache, dev_idx: usize) -> bool {
    cache.dev(dev_idx).is_matched()
}
