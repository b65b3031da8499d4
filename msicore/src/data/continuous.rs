use std::sync::Arc;

use itertools::izip;
use log::debug;
use nalgebra::Vector3;
use rayon::prelude::*;

use crate::algorithm::processing::{
    normalize_image, process_spectrum, smooth_image_mean, ImageSmoothing, ProcessingConfig,
};
use crate::data::image::{ImageVolume, PixelType};
use crate::data::spectral_image::SpectralImage;
use crate::data::spectrum::{SpectrumFormat, SpectrumSummary};
use crate::error::{MsiError, Result};

/// Converts a tolerance to an absolute half window around `center`.
///
/// # Arguments
///
/// * `center` - spectral coordinate
/// * `tolerance` - absolute tolerance, or parts per million if `in_ppm` is set
/// * `in_ppm` - interpret `tolerance` as ppm of `center`
///
pub fn apply_tolerance(center: f64, tolerance: f64, in_ppm: bool) -> f64 {
    if in_ppm {
        tolerance * 1e-6 * center
    } else {
        tolerance
    }
}

/// In-memory spectral image in continuous profile layout: every pixel shares one axis.
///
/// # Description
///
/// Spectra are stored per pixel of a single layer (x fastest). The display image holds
/// the total ion count of each pixel; the overview spectra are computed over all pixels
/// that are set in the mask (all pixels without a mask).
///
#[derive(Clone, Debug)]
pub struct ContinuousSpectrumImage {
    image: ImageVolume,
    mask: Option<ImageVolume>,
    x_axis: Arc<Vec<f64>>,
    spectra: Vec<Vec<f64>>,
    summary: SpectrumSummary,
    axis_label: String,
    tolerance_in_ppm: bool,
}

impl ContinuousSpectrumImage {
    /// Constructs a new `ContinuousSpectrumImage`.
    ///
    /// # Arguments
    ///
    /// * `width`, `height` - pixel grid of the slice
    /// * `spacing`, `origin` - slice geometry; `spacing.z` is the slice thickness
    /// * `x_axis` - ascending spectral axis shared by all pixels
    /// * `spectra` - one intensity vector per pixel, `width * height` in total
    ///
    pub fn new(
        width: usize,
        height: usize,
        spacing: Vector3<f64>,
        origin: Vector3<f64>,
        x_axis: Vec<f64>,
        spectra: Vec<Vec<f64>>,
    ) -> Result<Self> {
        if spectra.len() != width * height {
            return Err(MsiError::DimensionMismatch {
                expected: width * height,
                actual: spectra.len(),
            });
        }
        if let Some(bad) = spectra.iter().find(|s| s.len() != x_axis.len()) {
            return Err(MsiError::DimensionMismatch {
                expected: x_axis.len(),
                actual: bad.len(),
            });
        }
        if x_axis.windows(2).any(|w| w[1] < w[0]) {
            return Err(MsiError::InvalidInput("spectral axis must be ascending".to_string()));
        }

        let tic: Vec<f64> = spectra.iter().map(|s| s.iter().sum()).collect();
        let image = ImageVolume::from_data(&[width, height, 1], spacing, origin, PixelType::Float, tic)?;

        let mut spectrum_image = ContinuousSpectrumImage {
            image,
            mask: None,
            x_axis: Arc::new(x_axis),
            spectra,
            summary: SpectrumSummary::default(),
            axis_label: "m/z".to_string(),
            tolerance_in_ppm: false,
        };
        spectrum_image.summary = spectrum_image.compute_summary();
        Ok(spectrum_image)
    }

    /// Attach a label mask; pixels with value 0 are excluded from ion images and summaries.
    pub fn with_mask(mut self, mask: ImageVolume) -> Result<Self> {
        if !self.image.same_geometry(&mask) {
            return Err(MsiError::GeometryMismatch(format!(
                "mask {} does not match image {}",
                mask.shape_string(),
                self.image.shape_string()
            )));
        }
        self.mask = Some(mask.to_3d()?);
        self.summary = self.compute_summary();
        Ok(self)
    }

    pub fn with_axis_label(mut self, label: &str) -> Self {
        self.axis_label = label.to_string();
        self
    }

    pub fn with_tolerance_in_ppm(mut self, in_ppm: bool) -> Self {
        self.tolerance_in_ppm = in_ppm;
        self
    }

    pub fn x_axis(&self) -> &[f64] {
        &self.x_axis
    }

    fn is_masked_in(&self, pixel: usize) -> bool {
        match &self.mask {
            Some(mask) => mask.data()[pixel] != 0.0,
            None => true,
        }
    }

    fn compute_summary(&self) -> SpectrumSummary {
        let n = self.x_axis.len();
        let mut sum = vec![0.0; n];
        let mut max = vec![0.0; n];
        let mut count = 0usize;

        for (pixel, spectrum) in self.spectra.iter().enumerate() {
            if !self.is_masked_in(pixel) {
                continue;
            }
            count += 1;
            for (s, m, v) in izip!(sum.iter_mut(), max.iter_mut(), spectrum.iter()) {
                *s += v;
                *m = f64::max(*m, *v);
            }
        }

        let mean = if count > 0 {
            sum.iter().map(|s| s / count as f64).collect()
        } else {
            vec![0.0; n]
        };

        SpectrumSummary {
            x_axis: self.x_axis.to_vec(),
            sum,
            mean,
            max,
        }
    }
}

impl SpectralImage for ContinuousSpectrumImage {
    fn image(&self) -> &ImageVolume {
        &self.image
    }

    fn mask(&self) -> Option<&ImageVolume> {
        self.mask.as_ref()
    }

    fn summary(&self) -> &SpectrumSummary {
        &self.summary
    }

    fn format(&self) -> SpectrumFormat {
        SpectrumFormat::ContinuousProfile
    }

    fn axis_label(&self) -> &str {
        &self.axis_label
    }

    fn ion_image(
        &self,
        center: f64,
        tolerance: f64,
        config: &ProcessingConfig,
        target: &mut ImageVolume,
    ) -> Result<()> {
        let n = self.image.layer_len();
        if target.layer_len() != n {
            return Err(MsiError::DimensionMismatch {
                expected: n,
                actual: target.layer_len(),
            });
        }

        let tol = apply_tolerance(center, tolerance, self.tolerance_in_ppm);
        let lo = self.x_axis.partition_point(|x| *x < center - tol);
        let hi = self.x_axis.partition_point(|x| *x <= center + tol);
        if lo >= hi {
            debug!("No spectral samples within {} +/- {}", center, tol);
        }

        let mut layer: Vec<f64> = self
            .spectra
            .par_iter()
            .enumerate()
            .map(|(pixel, spectrum)| {
                if !self.is_masked_in(pixel) || lo >= hi {
                    return 0.0;
                }
                if config.is_identity_for_spectra() {
                    spectrum[lo..hi].iter().sum()
                } else {
                    process_spectrum(spectrum, config)[lo..hi].iter().sum()
                }
            })
            .collect();

        if config.image_smoothing == ImageSmoothing::Mean {
            layer = smooth_image_mean(
                &layer,
                self.image.size(0),
                self.image.size(1),
                config.image_smoothing_half_window,
            );
        }
        normalize_image(&mut layer, config.image_normalization);

        target.data_mut()[..n].copy_from_slice(&layer);
        Ok(())
    }
}
