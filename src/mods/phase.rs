use crate::mods::{geometry::Vec3, structure::SpeciesId};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhaseKind {
    Prerun,
    DynNorm,
    Main,
}

impl PhaseKind {
    pub const ALL: [PhaseKind; 3] = [PhaseKind::Prerun, PhaseKind::DynNorm, PhaseKind::Main];

    pub fn tag(&self) -> &'static str {
        match self {
            PhaseKind::Prerun => "PRERUN_PHASE",
            PhaseKind::DynNorm => "DYNNORM_PHASE",
            PhaseKind::Main => "MAIN_PHASE",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PhaseKind::Prerun => "Prerun",
            PhaseKind::DynNorm => "DynNorm",
            PhaseKind::Main => "Main",
        }
    }
}

/// Mantissa bits kept per bin, giving 1024 bins per octave.
pub const HISTOGRAM_MANTISSA_BITS: u32 = 10;

/// Smallest bin value not below `probability`. Values already on the grid map
/// to themselves, so the upper edge of a bin is never smaller than any sample
/// it holds.
pub fn bin_edge(probability: f64) -> f64 {
    if !(probability > 0.0) || !probability.is_finite() {
        return probability;
    }
    let mask = (1u64 << (52 - HISTOGRAM_MANTISSA_BITS)) - 1;
    let bits = probability.to_bits();
    if bits & mask == 0 {
        probability
    } else {
        f64::from_bits((bits | mask) + 1)
    }
}

/// Occurrence counts of non-negative probabilities on a log-scale grid. Each
/// sample lands in the bin whose upper edge is `bin_edge(p)`, so the number of
/// bins stays bounded by the dynamic range of the samples. Keys are the bit
/// patterns of the edges, which order like the values themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    counts: BTreeMap<u64, u64>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn record(&mut self, probability: f64) {
        *self.counts.entry(bin_edge(probability).to_bits()).or_insert(0) += 1;
    }

    pub fn insert(&mut self, probability: f64, count: u64) {
        *self.counts.entry(bin_edge(probability).to_bits()).or_insert(0) += count;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn max(&self) -> Option<f64> {
        self.counts.keys().next_back().map(|&b| f64::from_bits(b))
    }

    pub fn iter_descending(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        self.counts.iter().rev().map(|(&b, &c)| (f64::from_bits(b), c))
    }

    /// Largest value left once the `discard` largest samples are dropped.
    pub fn max_after_discarding(&self, discard: u64) -> Option<f64> {
        let mut skipped = 0;
        for (p, count) in self.iter_descending() {
            skipped += count;
            if skipped > discard {
                return Some(p);
            }
        }
        None
    }

    pub fn count_above(&self, threshold: f64) -> u64 {
        self.iter_descending()
            .take_while(|&(p, _)| p > threshold)
            .map(|(_, c)| c)
            .sum()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounters {
    /// Accepted jumps.
    pub steps: u64,
    pub attempts: u64,
    pub blocked: u64,
    pub overkill: u64,
    pub nonsense: u64,
}

/// Everything needed to continue a phase: counters, the RNG position and the
/// complete lattice state.
#[derive(Debug, Clone, PartialEq)]
pub struct SimPhaseInfo {
    pub kind: PhaseKind,
    pub target_steps: u64,
    pub target_attempts: u64,
    pub counters: PhaseCounters,
    pub sim_time: f64,
    pub normalization: f64,
    pub rng_word_pos: u128,
    pub occupation: Box<[SpeciesId]>,
    /// Accumulated displacement of the atom currently sitting on each site.
    pub displacement: Box<[Vec3]>,
    pub attempted: Histogram,
    pub accepted: Histogram,
    pub completed: bool,
}

impl SimPhaseInfo {
    pub fn new(
        kind: PhaseKind,
        target_steps: u64,
        target_attempts: u64,
        normalization: f64,
        occupation: Box<[SpeciesId]>,
    ) -> Self {
        let size = occupation.len();
        Self {
            kind,
            target_steps,
            target_attempts,
            counters: PhaseCounters::default(),
            sim_time: 0.0,
            normalization,
            rng_word_pos: 0,
            occupation,
            displacement: vec![Vec3::ZERO; size].into_boxed_slice(),
            attempted: Histogram::new(),
            accepted: Histogram::new(),
            completed: false,
        }
    }

    #[inline(always)]
    pub fn is_target_reached(&self) -> bool {
        (self.target_steps > 0 && self.counters.steps >= self.target_steps)
            || (self.target_attempts > 0 && self.counters.attempts >= self.target_attempts)
    }

    /// Fraction of the phase done, for progress output.
    pub fn progress(&self) -> f64 {
        if self.target_steps > 0 {
            self.counters.steps as f64 / self.target_steps as f64
        } else if self.target_attempts > 0 {
            self.counters.attempts as f64 / self.target_attempts as f64
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_iterates_descending() {
        let mut h = Histogram::new();
        for p in [0.25, 0.875, 0.25, 0.0, 1.5] {
            h.record(p);
        }
        let items: Vec<(f64, u64)> = h.iter_descending().collect();
        assert_eq!(items, vec![(1.5, 1), (0.875, 1), (0.25, 2), (0.0, 1)]);
        assert_eq!(h.total(), 5);
        assert_eq!(h.max(), Some(1.5));
        assert_eq!(h.count_above(1.0), 1);
    }

    #[test]
    fn samples_round_up_to_the_bin_edge() {
        let mut h = Histogram::new();
        h.record(0.2);
        h.record(0.2000001);
        assert_eq!(h.len(), 1);
        let edge = h.max().expect("sample");
        assert!(edge >= 0.2000001);
        assert!(edge - 0.2 < 0.2 / 1024.0);
        assert_eq!(bin_edge(edge), edge);
        assert_eq!(bin_edge(1.0), 1.0);
        assert_eq!(h.count_above(0.2), 2);
    }

    #[test]
    fn bin_count_stays_bounded_for_distinct_samples() {
        let mut h = Histogram::new();
        let samples = 200_000u64;
        for i in 0..samples {
            // Spread over four octaves, every value distinct.
            let p = 0.0625 * (1.0 + 15.0 * i as f64 / samples as f64);
            h.record(p);
        }
        assert_eq!(h.total(), samples);
        assert!(h.len() <= 4 * 1024 + 1, "{} bins", h.len());
        assert!(h.max().expect("samples") >= 0.0625 * (1.0 + 15.0 * (samples - 1) as f64 / samples as f64));
    }

    #[test]
    fn outliers_are_discarded_by_count() {
        let mut h = Histogram::new();
        h.insert(3.0, 1);
        h.insert(2.0, 2);
        h.insert(1.0, 10);
        assert_eq!(h.max_after_discarding(0), Some(3.0));
        assert_eq!(h.max_after_discarding(1), Some(2.0));
        assert_eq!(h.max_after_discarding(2), Some(2.0));
        assert_eq!(h.max_after_discarding(3), Some(1.0));
        assert_eq!(h.max_after_discarding(13), None);
    }

    #[test]
    fn targets_by_steps_or_attempts() {
        let mut info = SimPhaseInfo::new(PhaseKind::Main, 10, 0, 1.0, vec![1, 0].into_boxed_slice());
        assert_eq!(info.displacement.len(), 2);
        info.counters.attempts = 100;
        assert!(!info.is_target_reached());
        info.counters.steps = 10;
        assert!(info.is_target_reached());

        let mut norm = SimPhaseInfo::new(PhaseKind::DynNorm, 0, 5, 1.0, vec![0].into_boxed_slice());
        norm.counters.attempts = 5;
        assert!(norm.is_target_reached());
    }

    #[test]
    fn tags_round_trip() {
        for kind in PhaseKind::ALL {
            assert_eq!(PhaseKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PhaseKind::from_tag("OTHER"), None);
    }
}
