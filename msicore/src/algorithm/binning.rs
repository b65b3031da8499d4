use itertools::izip;
use log::warn;

use crate::data::spectrum::SpectrumSummary;

/// Default number of bins of the global overview spectrum.
pub const DEFAULT_BIN_COUNT: usize = 15000;

/// Merge the overview spectra of several slices onto one shared, binned axis.
///
/// # Description
///
/// The global range spans the first to the last axis value over all slices and is cut into
/// `bins` equal-width bins. Every sample lands in bin `floor((x - min) / bin_size)`, clamped
/// to the valid range. Per bin the axis, sum and mean channels are averaged over the number
/// of contributing samples while the max channel keeps the true maximum. Bins without any
/// sample are dropped, so the result has at most `bins` entries.
///
/// # Arguments
///
/// * `slices` - overview spectra of all slices
/// * `bins` - number of bins
///
/// # Returns
///
/// The binned global spectrum; empty if no slice has samples or `bins` is zero
///
/// # Example
///
/// ```rust
/// # use msicore::algorithm::binning::bin_spectra;
/// # use msicore::data::spectrum::SpectrumSummary;
/// let a = SpectrumSummary::new(vec![100.0], vec![4.0], vec![1.0], vec![4.0]).unwrap();
/// let b = SpectrumSummary::new(vec![100.0], vec![6.0], vec![3.0], vec![6.0]).unwrap();
/// let merged = bin_spectra(&[&a, &b], 10);
/// assert_eq!(merged.sum, vec![5.0]);
/// assert_eq!(merged.max, vec![6.0]);
/// ```
pub fn bin_spectra(slices: &[&SpectrumSummary], bins: usize) -> SpectrumSummary {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for slice in slices {
        if let Some((lo, hi)) = slice.range() {
            min = min.min(lo);
            max = max.max(hi);
        }
    }

    if bins == 0 || min > max {
        warn!("Nothing to bin: {} spectra, {} bins", slices.len(), bins);
        return SpectrumSummary::default();
    }

    let bin_size = (max - min) / bins as f64;

    let mut x_acc = vec![0.0; bins];
    let mut sum_acc = vec![0.0; bins];
    let mut mean_acc = vec![0.0; bins];
    let mut max_acc = vec![f64::MIN; bins];
    let mut hits = vec![0usize; bins];

    for slice in slices {
        for (x, s, m, mx) in izip!(&slice.x_axis, &slice.sum, &slice.mean, &slice.max) {
            let j = bin_index(*x, min, bin_size, bins);
            x_acc[j] += x;
            sum_acc[j] += s;
            mean_acc[j] += m;
            max_acc[j] = max_acc[j].max(*mx);
            hits[j] += 1;
        }
    }

    let mut result = SpectrumSummary::default();
    for k in 0..bins {
        if hits[k] == 0 {
            continue;
        }
        let n = hits[k] as f64;
        result.x_axis.push(x_acc[k] / n);
        result.sum.push(sum_acc[k] / n);
        result.mean.push(mean_acc[k] / n);
        result.max.push(max_acc[k]);
    }
    result
}

fn bin_index(x: f64, min: f64, bin_size: f64, bins: usize) -> usize {
    if bin_size <= 0.0 {
        return 0;
    }
    let j = ((x - min) / bin_size).floor();
    if j.is_nan() || j < 0.0 {
        0
    } else if j >= bins as f64 {
        bins - 1
    } else {
        j as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn summary(x: Vec<f64>, sum: Vec<f64>, mean: Vec<f64>, max: Vec<f64>) -> SpectrumSummary {
        SpectrumSummary::new(x, sum, mean, max).unwrap()
    }

    #[test]
    fn test_same_coordinate_is_averaged_but_max_is_kept() {
        let a = summary(vec![100.0, 200.0], vec![4.0, 1.0], vec![2.0, 1.0], vec![4.0, 1.0]);
        let b = summary(vec![100.0, 200.0], vec![6.0, 1.0], vec![4.0, 1.0], vec![6.0, 1.0]);
        let merged = bin_spectra(&[&a, &b], 100);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged.x_axis[0], 100.0);
        assert_eq!(merged.sum[0], 5.0);
        assert_eq!(merged.mean[0], 3.0);
        assert_eq!(merged.max[0], 6.0);
        // the upper range bound is clamped into the last bin
        assert_eq!(merged.x_axis[1], 200.0);
    }

    #[test]
    fn test_empty_bins_are_dropped() {
        let a = summary(vec![0.0, 10.0], vec![1.0, 1.0], vec![1.0, 1.0], vec![1.0, 1.0]);
        let b = summary(vec![5.0], vec![1.0], vec![1.0], vec![1.0]);
        let merged = bin_spectra(&[&a, &b], 1000);
        assert_eq!(merged.len(), 3);
        assert!(merged.len() <= 1000);
        assert!(merged.sum.iter().all(|v| *v == 1.0));
    }

    #[test]
    fn test_output_never_exceeds_bin_count() {
        let x: Vec<f64> = (0..500).map(|i| 100.0 + i as f64 * 0.37).collect();
        let ones = vec![1.0; x.len()];
        let a = summary(x.clone(), ones.clone(), ones.clone(), ones.clone());
        let merged = bin_spectra(&[&a], 16);
        assert_eq!(merged.len(), 16);
        assert!(merged.x_axis.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(bin_spectra(&[], 10).is_empty());
        let single = summary(vec![42.0], vec![3.0], vec![3.0], vec![3.0]);
        let merged = bin_spectra(&[&single, &single], 10);
        assert_eq!(merged.x_axis, vec![42.0]);
        assert_eq!(merged.sum, vec![3.0]);
        assert!(bin_spectra(&[&single], 0).is_empty());
    }

    fn random_summary(rng: &mut StdRng) -> SpectrumSummary {
        let n = rng.gen_range(1..300);
        let start = rng.gen_range(50.0..500.0);
        let mut x = Vec::with_capacity(n);
        let mut at = start;
        for _ in 0..n {
            at += rng.gen_range(0.0..2.0);
            x.push(at);
        }
        let sum: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1000.0)).collect();
        let mean: Vec<f64> = sum.iter().map(|s| s / 10.0).collect();
        let max: Vec<f64> = sum.iter().map(|s| s / 2.0).collect();
        summary(x, sum, mean, max)
    }

    #[test]
    fn test_random_slices_bin_into_ascending_axis() {
        let mut rng = StdRng::seed_from_u64(17);
        for _ in 0..50 {
            let slices: Vec<SpectrumSummary> = (0..rng.gen_range(1..6)).map(|_| random_summary(&mut rng)).collect();
            let refs: Vec<&SpectrumSummary> = slices.iter().collect();
            let bins = rng.gen_range(1..400);
            let merged = bin_spectra(&refs, bins);

            let lo = slices.iter().filter_map(|s| s.range()).map(|r| r.0).fold(f64::MAX, f64::min);
            let hi = slices.iter().filter_map(|s| s.range()).map(|r| r.1).fold(f64::MIN, f64::max);
            let peak = slices.iter().flat_map(|s| s.max.iter().copied()).fold(f64::MIN, f64::max);

            assert!(!merged.is_empty());
            assert!(merged.len() <= bins);
            assert_eq!(merged.sum.len(), merged.len());
            assert!(merged.x_axis.windows(2).all(|w| w[0] <= w[1]));
            assert!(merged.x_axis.iter().all(|x| *x >= lo - 1e-9 && *x <= hi + 1e-9));
            assert!(merged.max.iter().all(|m| *m <= peak));
            assert_eq!(merged.max.iter().copied().fold(f64::MIN, f64::max), peak);
        }
    }
}
