//! Symmetry merging of equivalent reflections.

use crate::collection::PeakCollection;
use crate::dataset::DataSet;
use crate::intensity::Intensity;
use crate::miller::MillerIndex;
use crate::peak::{Peak, RejectionFlag};
use crate::random;
use crate::space_group::SpaceGroup;
use crate::unit_cell::UnitCell;
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Outcome of adding a peak to a merged set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeFlag {
    /// The observation was merged.
    Added,
    /// The peak was rejected or unindexed and was skipped.
    Invalid,
}

/// One observation contributing to a merged reflection.
#[derive(Clone, Copy, Debug)]
pub struct Observation {
    /// Original (unmapped) Miller index.
    pub hkl: MillerIndex,
    /// Corrected intensity at merge time.
    pub intensity: Intensity,
    /// Frame coordinate of the peak centre.
    pub frame: f64,
    /// Resolution of the observation.
    pub d: f64,
}

/// A symmetry-unique reflection with its merged observations.
#[derive(Clone, Debug)]
pub struct MergedPeak {
    representative: MillerIndex,
    observations: Vec<Observation>,
    intensity_sum: Intensity,
}

impl MergedPeak {
    pub(crate) fn new(representative: MillerIndex) -> Self {
        Self {
            representative,
            observations: Vec::new(),
            intensity_sum: Intensity::new(0.0, 0.0),
        }
    }

    pub(crate) fn add(&mut self, observation: Observation) {
        self.intensity_sum += observation.intensity;
        self.observations.push(observation);
    }

    /// The representative index: the lexicographically maximal image of
    /// the orbit.
    #[must_use]
    pub const fn index(&self) -> &MillerIndex {
        &self.representative
    }

    /// The merged observations.
    #[must_use]
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Number of merged observations.
    #[must_use]
    pub fn redundancy(&self) -> usize {
        self.observations.len()
    }

    /// Merged intensity: the arithmetic mean, with variance
    /// `sum(sigma_i^2) / n^2`.
    #[must_use]
    pub fn intensity(&self) -> Intensity {
        self.intensity_sum / self.observations.len() as f64
    }

    /// Resolution of the first observation.
    #[must_use]
    pub fn d(&self) -> f64 {
        self.observations.first().map_or(0.0, |o| o.d)
    }

    /// `chi^2 = sum((I_i - I)^2 / sigma_i^4)`, approximately chi-squared
    /// with `n - 1` degrees of freedom. Zero without redundancy.
    #[must_use]
    pub fn chi2(&self) -> f64 {
        if self.redundancy() < 2 {
            return 0.0;
        }
        let merged = self.intensity().value();
        self.observations
            .iter()
            .map(|o| {
                let x = (o.intensity.value() - merged) / o.intensity.variance();
                x * x
            })
            .sum()
    }

    /// CDF of `chi^2_(n-1)` at the observed statistic; a value close to
    /// one flags variance beyond the counting error.
    #[must_use]
    pub fn p_value(&self) -> f64 {
        let k = self.redundancy() as f64 - 1.0;
        if k < 0.9 {
            return 0.0;
        }
        let Ok(dist) = ChiSquared::new(k) else {
            return 0.0;
        };
        dist.cdf(self.chi2())
    }

    /// Randomly split the observations into two halves (used by the
    /// CC(1/2) estimate). Uses the process RNG.
    #[must_use]
    pub fn split(&self) -> (Self, Self) {
        let mut order: Vec<usize> = (0..self.observations.len()).collect();
        random::shuffle(&mut order);
        let parity = random::below(2);

        let mut first = Self::new(self.representative);
        let mut second = Self::new(self.representative);
        for (i, idx) in order.into_iter().enumerate() {
            if i % 2 == parity {
                first.add(self.observations[idx]);
            } else {
                second.add(self.observations[idx]);
            }
        }
        (first, second)
    }
}

/// The set of merged reflections of one or more peak collections, keyed
/// and ordered by representative index.
pub struct MergedPeakCollection {
    group: SpaceGroup,
    friedel: bool,
    sum_intensity: bool,
    merged: BTreeMap<(i32, i32, i32), MergedPeak>,
    n_invalid: usize,
    d_min: f64,
    d_max: f64,
    frame_range: Option<(f64, f64)>,
    max_peaks: usize,
}

impl MergedPeakCollection {
    /// Empty merged set for a space group. `sum_intensity` selects the
    /// pixel-sum intensities, otherwise the profile ones; `friedel` merges
    /// Friedel mates even in a non-centrosymmetric group.
    #[must_use]
    pub fn new(group: SpaceGroup, friedel: bool, sum_intensity: bool) -> Self {
        Self {
            group,
            friedel,
            sum_intensity,
            merged: BTreeMap::new(),
            n_invalid: 0,
            d_min: 0.0,
            d_max: f64::INFINITY,
            frame_range: None,
            max_peaks: 0,
        }
    }

    /// Restrict merging to a d range.
    pub fn set_d_range(&mut self, d_min: f64, d_max: f64) {
        self.d_min = d_min;
        self.d_max = d_max;
    }

    /// Restrict merging to a frame range.
    pub fn set_frame_range(&mut self, first: f64, last: f64) {
        self.frame_range = Some((first, last));
    }

    /// Record the theoretical unique reflection count for completeness.
    pub fn set_max_peaks(
        &mut self,
        data: &Arc<DataSet>,
        cell: &Arc<RwLock<UnitCell>>,
        d_min: f64,
        d_max: f64,
    ) {
        self.set_d_range(d_min, d_max);
        self.max_peaks = cell.read().expect("cell poisoned").max_peaks(
            d_min,
            d_max,
            data.wavelength(),
            self.friedel,
        );
        info!(max_peaks = self.max_peaks, "theoretical maximum in d range");
    }

    /// The theoretical unique reflection count, zero when never set.
    #[must_use]
    pub const fn max_peaks(&self) -> usize {
        self.max_peaks
    }

    /// Whether pixel-sum intensities are merged.
    #[must_use]
    pub const fn sum_intensity(&self) -> bool {
        self.sum_intensity
    }

    /// Whether Friedel mates are merged.
    #[must_use]
    pub const fn friedel(&self) -> bool {
        self.friedel
    }

    /// The space group used for equivalence.
    #[must_use]
    pub const fn group(&self) -> &SpaceGroup {
        &self.group
    }

    /// Merge every peak of a collection.
    pub fn add_collection(&mut self, collection: &PeakCollection) {
        info!(collection = collection.name(), "merging peaks");
        for peak in collection.peaks() {
            self.add_peak(peak);
        }
        info!(
            observed = self.total_size(),
            unique = self.n_unique(),
            invalid = self.n_invalid,
            "merge bookkeeping"
        );
    }

    /// Merge one peak. Rejected, unindexed, out-of-range, or
    /// uncorrectable peaks count as invalid and are skipped.
    pub fn add_peak(&mut self, peak: &Peak) -> MergeFlag {
        let flag = if self.sum_intensity {
            peak.sum_rejection_flag()
        } else {
            peak.profile_rejection_flag()
        };
        if flag != RejectionFlag::NotRejected {
            self.n_invalid += 1;
            return MergeFlag::Invalid;
        }
        if peak.hkl().is_null() {
            self.n_invalid += 1;
            return MergeFlag::Invalid;
        }

        let frame = peak.shape().center()[2];
        if let Some((first, last)) = self.frame_range {
            if frame < first || frame > last {
                self.n_invalid += 1;
                return MergeFlag::Invalid;
            }
        }

        let Some(d) = peak.d() else {
            self.n_invalid += 1;
            return MergeFlag::Invalid;
        };
        if d < self.d_min || d > self.d_max {
            self.n_invalid += 1;
            return MergeFlag::Invalid;
        }

        let intensity = if self.sum_intensity {
            peak.corrected_sum_intensity()
        } else {
            peak.corrected_profile_intensity()
        };
        if !intensity.is_valid() {
            self.n_invalid += 1;
            return MergeFlag::Invalid;
        }

        let representative = self.group.representative(peak.hkl(), self.friedel);
        let key = (representative.h(), representative.k(), representative.l());
        self.merged
            .entry(key)
            .or_insert_with(|| MergedPeak::new(representative))
            .add(Observation {
                hkl: *peak.hkl(),
                intensity,
                frame,
                d,
            });
        MergeFlag::Added
    }

    /// The merged peaks, ordered by representative index.
    pub fn merged_peaks(&self) -> impl Iterator<Item = &MergedPeak> {
        self.merged.values()
    }

    /// Number of symmetry-unique reflections.
    #[must_use]
    pub fn n_unique(&self) -> usize {
        self.merged.len()
    }

    /// Number of peaks skipped as invalid.
    #[must_use]
    pub const fn n_invalid(&self) -> usize {
        self.n_invalid
    }

    /// Total number of merged observations.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.merged.values().map(MergedPeak::redundancy).sum()
    }

    /// Mean observations per unique reflection.
    #[must_use]
    pub fn redundancy(&self) -> f64 {
        if self.merged.is_empty() {
            return 0.0;
        }
        self.total_size() as f64 / self.merged.len() as f64
    }

    /// Sum of the per-reflection `chi^2` statistics, the rescaler's
    /// objective.
    #[must_use]
    pub fn sum_chi2(&self) -> f64 {
        self.merged.values().map(MergedPeak::chi2).sum()
    }

    /// Lower d bound.
    #[must_use]
    pub const fn d_min(&self) -> f64 {
        self.d_min
    }

    /// Upper d bound.
    #[must_use]
    pub const fn d_max(&self) -> f64 {
        self.d_max
    }

    /// Drop all merged peaks, keeping the configuration.
    pub fn clear(&mut self) {
        self.merged.clear();
        self.n_invalid = 0;
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&mut self, peak: MergedPeak) {
        let key = (peak.index().h(), peak.index().k(), peak.index().l());
        self.merged.insert(key, peak);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intensity::Intensity;

    fn observation(h: i32, k: i32, l: i32, value: f64, variance: f64) -> Observation {
        Observation {
            hkl: MillerIndex::new(h, k, l),
            intensity: Intensity::new(value, variance),
            frame: 0.0,
            d: 2.0,
        }
    }

    #[test]
    fn merged_intensity_is_the_mean() {
        let mut merged = MergedPeak::new(MillerIndex::new(1, 1, 1));
        merged.add(observation(1, 1, 1, 10.0, 4.0));
        merged.add(observation(-1, -1, -1, 14.0, 4.0));
        let intensity = merged.intensity();
        assert!((intensity.value() - 12.0).abs() < 1e-12);
        // sigma^2 = sum(sigma_i^2) / n^2
        assert!((intensity.variance() - 2.0).abs() < 1e-12);
        assert_eq!(merged.redundancy(), 2);
    }

    #[test]
    fn chi2_and_p_value() {
        let mut merged = MergedPeak::new(MillerIndex::new(2, 0, 0));
        merged.add(observation(2, 0, 0, 10.0, 2.0));
        merged.add(observation(0, 2, 0, 14.0, 2.0));
        // deviations +-2 with sigma^2 = 2: each term is (2/2)^2 = 1
        assert!((merged.chi2() - 2.0).abs() < 1e-12);
        let p = merged.p_value();
        assert!(p > 0.0 && p < 1.0);

        let mut single = MergedPeak::new(MillerIndex::new(1, 0, 0));
        single.add(observation(1, 0, 0, 5.0, 1.0));
        assert!(single.chi2().abs() < f64::EPSILON);
        assert!(single.p_value().abs() < f64::EPSILON);
    }

    #[test]
    fn split_partitions_observations() {
        let _guard = crate::random::test_lock();
        crate::random::seed(11);
        let mut merged = MergedPeak::new(MillerIndex::new(1, 2, 3));
        for i in 0..9 {
            merged.add(observation(1, 2, 3, f64::from(i), 1.0));
        }
        let (a, b) = merged.split();
        assert_eq!(a.redundancy() + b.redundancy(), 9);
        assert!(a.redundancy() >= 4 && b.redundancy() >= 4);
    }
}
