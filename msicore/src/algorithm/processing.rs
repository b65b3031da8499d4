use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, OrderStatistics};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BaselineCorrection {
    None,
    TopHat,
    Median,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Smoothing {
    None,
    SavitzkyGolay,
    Gaussian,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Normalization {
    None,
    Tic,
    Max,
    Rms,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum IntensityTransform {
    None,
    Log,
    Sqrt,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ImageSmoothing {
    None,
    Mean,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ImageNormalization {
    None,
    Max,
}

macro_rules! strategy_names {
    ($ty:ident { $($variant:ident => $name:expr),+ $(,)? }) => {
        impl $ty {
            /// Parses a strategy name as used in processing parameter files.
            pub fn from_name(name: &str) -> Option<$ty> {
                let name = name.trim().trim_matches('"');
                $(
                    if name.eq_ignore_ascii_case($name) {
                        return Some($ty::$variant);
                    }
                )+
                None
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name,)+
                }
            }
        }

        impl Default for $ty {
            fn default() -> Self {
                $ty::None
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.name())
            }
        }
    };
}

strategy_names!(BaselineCorrection { None => "None", TopHat => "TopHat", Median => "Median" });
strategy_names!(Smoothing { None => "None", SavitzkyGolay => "SavitzkyGolay", Gaussian => "Gaussian" });
strategy_names!(Normalization { None => "None", Tic => "TIC", Max => "Max", Rms => "RMS" });
strategy_names!(IntensityTransform { None => "None", Log => "Log", Sqrt => "Sqrt" });
strategy_names!(ImageSmoothing { None => "None", Mean => "Mean" });
strategy_names!(ImageNormalization { None => "None", Max => "Max" });

/// Signal processing settings applied when an ion image is synthesized.
///
/// The stack hands one value of this type to every slice on each query, slices never
/// keep processing state of their own between queries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Baseline correction strategy (default: None)
    pub baseline_correction: BaselineCorrection,
    /// Half window of the baseline filter in samples (default: 50)
    pub baseline_half_window: usize,
    /// Spectrum smoothing strategy (default: None)
    pub smoothing: Smoothing,
    /// Half window of the smoothing kernel in samples (default: 2)
    pub smoothing_half_window: usize,
    /// Per-spectrum normalization (default: None)
    pub normalization: Normalization,
    /// Intensity transformation applied after normalization (default: None)
    pub intensity_transform: IntensityTransform,
    /// Smoothing of the synthesized ion image (default: None)
    pub image_smoothing: ImageSmoothing,
    /// Half window of the image smoothing kernel in pixels (default: 1)
    pub image_smoothing_half_window: usize,
    /// Normalization of the synthesized ion image (default: None)
    pub image_normalization: ImageNormalization,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        ProcessingConfig {
            baseline_correction: BaselineCorrection::None,
            baseline_half_window: 50,
            smoothing: Smoothing::None,
            smoothing_half_window: 2,
            normalization: Normalization::None,
            intensity_transform: IntensityTransform::None,
            image_smoothing: ImageSmoothing::None,
            image_smoothing_half_window: 1,
            image_normalization: ImageNormalization::None,
        }
    }
}

impl ProcessingConfig {
    /// True if no per-spectrum step would change the raw intensities.
    pub fn is_identity_for_spectra(&self) -> bool {
        self.baseline_correction == BaselineCorrection::None
            && self.smoothing == Smoothing::None
            && self.normalization == Normalization::None
            && self.intensity_transform == IntensityTransform::None
    }
}

fn rolling<F>(values: &[f64], half_window: usize, reduce: F) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let n = values.len();
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half_window);
            let hi = (i + half_window + 1).min(n);
            reduce(&values[lo..hi])
        })
        .collect()
}

fn window_min(w: &[f64]) -> f64 {
    w.iter().cloned().fold(f64::INFINITY, f64::min)
}

fn window_max(w: &[f64]) -> f64 {
    w.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
}

/// Subtract a morphological opening (erosion followed by dilation) from the signal.
///
/// # Arguments
/// * `intensity` - raw intensities
/// * `half_window` - half width of the structuring element in samples
///
/// # Returns
/// Baseline corrected intensities, never negative for non-negative input
pub fn baseline_tophat(intensity: &[f64], half_window: usize) -> Vec<f64> {
    let eroded = rolling(intensity, half_window, window_min);
    let opened = rolling(&eroded, half_window, window_max);
    intensity
        .iter()
        .zip(opened.iter())
        .map(|(x, b)| x - b)
        .collect()
}

/// Subtract a rolling median baseline, negative residuals are clipped to zero.
pub fn baseline_median(intensity: &[f64], half_window: usize) -> Vec<f64> {
    let baseline = rolling(intensity, half_window, |w| Data::new(w.to_vec()).median());
    intensity
        .iter()
        .zip(baseline.iter())
        .map(|(x, b)| (x - b).max(0.0))
        .collect()
}

/// Quadratic Savitzky-Golay smoothing with a window of `2 * half_window + 1` samples.
///
/// Samples beyond the borders repeat the border value.
pub fn smooth_savitzky_golay(intensity: &[f64], half_window: usize) -> Vec<f64> {
    if half_window == 0 || intensity.is_empty() {
        return intensity.to_vec();
    }
    let m = half_window as f64;
    let norm = (2.0 * m + 1.0) * (4.0 * m * m + 4.0 * m - 3.0);
    let coefficients: Vec<f64> = (-(half_window as i64)..=half_window as i64)
        .map(|i| {
            let i = i as f64;
            (3.0 * (3.0 * m * m + 3.0 * m - 1.0) - 15.0 * i * i) / norm
        })
        .collect();
    convolve_clamped(intensity, &coefficients)
}

/// Gaussian smoothing with sigma equal to half the half window.
pub fn smooth_gaussian(intensity: &[f64], half_window: usize) -> Vec<f64> {
    if half_window == 0 || intensity.is_empty() {
        return intensity.to_vec();
    }
    let sigma = half_window as f64 / 2.0;
    let kernel: Vec<f64> = (-(half_window as i64)..=half_window as i64)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = kernel.iter().sum();
    let kernel: Vec<f64> = kernel.iter().map(|k| k / total).collect();
    convolve_clamped(intensity, &kernel)
}

fn convolve_clamped(values: &[f64], kernel: &[f64]) -> Vec<f64> {
    let n = values.len() as i64;
    let half = (kernel.len() / 2) as i64;
    (0..n)
        .map(|i| {
            kernel
                .iter()
                .enumerate()
                .map(|(k, c)| {
                    let j = (i + k as i64 - half).clamp(0, n - 1);
                    c * values[j as usize]
                })
                .sum()
        })
        .collect()
}

/// Scale a spectrum by its normalization factor; a zero factor leaves it unchanged.
pub fn normalize_spectrum(intensity: &mut [f64], strategy: Normalization) {
    let factor = match strategy {
        Normalization::None => return,
        Normalization::Tic => intensity.iter().sum::<f64>(),
        Normalization::Max => window_max(intensity),
        Normalization::Rms => {
            if intensity.is_empty() {
                return;
            }
            (intensity.iter().map(|x| x * x).sum::<f64>() / intensity.len() as f64).sqrt()
        }
    };
    if factor > 0.0 && factor.is_finite() {
        intensity.iter_mut().for_each(|x| *x /= factor);
    }
}

pub fn transform_intensity(intensity: &mut [f64], transform: IntensityTransform) {
    match transform {
        IntensityTransform::None => {}
        IntensityTransform::Log => intensity.iter_mut().for_each(|x| *x = x.max(0.0).ln_1p()),
        IntensityTransform::Sqrt => intensity.iter_mut().for_each(|x| *x = x.max(0.0).sqrt()),
    }
}

/// Run the per-spectrum pipeline: smoothing, baseline correction, normalization and
/// intensity transformation, in that order.
///
/// # Arguments
/// * `intensity` - raw intensities of one spectrum
/// * `config` - processing configuration
///
/// # Returns
/// Processed intensities, same length as the input
pub fn process_spectrum(intensity: &[f64], config: &ProcessingConfig) -> Vec<f64> {
    let smoothed = match config.smoothing {
        Smoothing::None => intensity.to_vec(),
        Smoothing::SavitzkyGolay => smooth_savitzky_golay(intensity, config.smoothing_half_window),
        Smoothing::Gaussian => smooth_gaussian(intensity, config.smoothing_half_window),
    };

    let mut corrected = match config.baseline_correction {
        BaselineCorrection::None => smoothed,
        BaselineCorrection::TopHat => baseline_tophat(&smoothed, config.baseline_half_window),
        BaselineCorrection::Median => baseline_median(&smoothed, config.baseline_half_window),
    };

    normalize_spectrum(&mut corrected, config.normalization);
    transform_intensity(&mut corrected, config.intensity_transform);
    corrected
}

/// Box filter over one image layer (`width` x `height`, x fastest).
pub fn smooth_image_mean(layer: &[f64], width: usize, height: usize, half_window: usize) -> Vec<f64> {
    if half_window == 0 {
        return layer.to_vec();
    }
    let mut out = vec![0.0; layer.len()];
    for y in 0..height {
        for x in 0..width {
            let (y0, y1) = (y.saturating_sub(half_window), (y + half_window + 1).min(height));
            let (x0, x1) = (x.saturating_sub(half_window), (x + half_window + 1).min(width));
            let mut sum = 0.0;
            for yy in y0..y1 {
                sum += layer[yy * width + x0..yy * width + x1].iter().sum::<f64>();
            }
            out[y * width + x] = sum / ((y1 - y0) * (x1 - x0)) as f64;
        }
    }
    out
}

pub fn normalize_image(layer: &mut [f64], strategy: ImageNormalization) {
    if strategy == ImageNormalization::Max {
        let max = window_max(layer);
        if max > 0.0 && max.is_finite() {
            layer.iter_mut().for_each(|v| *v /= max);
        }
    }
}
