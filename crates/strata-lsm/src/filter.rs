//! The filter (Bloom) collaborator contract.
//!
//! The engine never builds or probes filters itself; a table-layer implementation plugs in
//! behind this trait. What the engine does own is the runtime `bits_use` override, which
//! lets an operator cheapen probing without rebuilding tables.

/// A policy for building and consulting per-table key filters.
pub trait FilterPolicy: Send + Sync {
    /// The name persisted alongside filters; changing the algorithm requires a new name.
    fn name(&self) -> &'static str;

    /// Build a filter over `keys`, appending its encoding to `output`.
    fn create_filter(&self, keys: &[&[u8]], output: &mut Vec<u8>);

    /// May return false positives, never false negatives.
    fn key_may_match(&self, key: &[u8], filter: &[u8]) -> bool;
}

/// The effective probe count of a Bloom filter honouring a runtime `bits_use` override:
/// `min(bits_per_key, bits_use) * ln 2`, rounded down to shave probing cost.
#[must_use]
pub fn bloom_filter_probes(bits_per_key: u32, bits_use: Option<u32>) -> u32 {
    let effective = match bits_use {
        Some(bits_use) if bits_use > 0 && bits_use < bits_per_key => bits_use,
        _ => bits_per_key,
    };
    (f64::from(effective) * 0.69) as u32
}


#[cfg(test)]
mod tests {
    use super::*;


    #[test]
    fn bits_use_truncates_probes() {
        assert_eq!(bloom_filter_probes(10, None), 6);
        assert_eq!(bloom_filter_probes(10, Some(4)), 2);
        // An override above bits_per_key has no effect.
        assert_eq!(bloom_filter_probes(10, Some(20)), 6);
        assert_eq!(bloom_filter_probes(10, Some(0)), 6);
    }
}
