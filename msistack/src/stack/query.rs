use std::mem;
use std::ops::Range;

use log::{error, info};
use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use msicore::algorithm::processing::ProcessingConfig;
use msicore::data::image::{ImageVolume, PixelType};
use msicore::error::{MsiError, Result};

use crate::registration::orchestrator::RegistrationOrchestrator;
use crate::stack::slice_stack::{aligned, spectral_of, SliceStack, INTENSITY_INTERPOLATION_ORDER};

/// Split `0..n` into at most `workers` contiguous ranges of near-equal length.
///
/// # Arguments
///
/// * `n` - number of items
/// * `workers` - number of ranges requested, at least one is used
///
/// # Returns
///
/// Non-empty ranges covering `0..n` in order
pub fn partition_ranges(n: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1).min(n.max(1));
    let chunk = n / workers;
    let remainder = n % workers;

    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0;
    for w in 0..workers {
        let len = chunk + usize::from(w < remainder);
        if len > 0 {
            ranges.push(start..start + len);
        }
        start += len;
    }
    ranges
}

/// Result of one ion-image query over all slices.
#[derive(Debug, Default)]
pub struct QueryReport {
    /// z-layers that received data, ascending.
    pub written: Vec<usize>,
    /// Slices that failed, with the reason, ascending by slice.
    pub failures: Vec<(usize, MsiError)>,
}

impl QueryReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Ion image of one slice in the stack frame.
fn extract_slice(
    slice: &RegistrationOrchestrator,
    center: f64,
    tolerance: f64,
    config: &ProcessingConfig,
) -> Result<ImageVolume> {
    let spectral = spectral_of(slice)?;
    let mut scratch = spectral.image().like(PixelType::Float);
    spectral.ion_image(center, tolerance, config, &mut scratch)?;
    aligned(slice, &scratch, PixelType::Float, INTENSITY_INTERPOLATION_ORDER)
}

impl SliceStack {
    /// Synthesize the ion image of every slice and scatter it into `output`.
    ///
    /// # Description
    ///
    /// Slices are processed on a dedicated thread pool, each worker handling one contiguous
    /// range of slice indices. Extraction and warping run without synchronization; only the
    /// copy into the shared z-layer of `output` is serialized. A failing slice is reported
    /// and leaves its layer untouched without affecting the others. `output` is marked
    /// modified once, after all workers finished.
    ///
    /// # Arguments
    ///
    /// * `center` - spectral coordinate of the ion image
    /// * `tolerance` - half width of the integration window
    /// * `config` - processing settings applied to every slice for this query
    /// * `output` - destination volume with one z-layer per slot
    ///
    /// # Returns
    ///
    /// * `QueryReport` - written layers and per-slice failures
    pub fn get_image(
        &self,
        center: f64,
        tolerance: f64,
        config: &ProcessingConfig,
        output: &mut ImageVolume,
    ) -> Result<QueryReport> {
        if output.depth() < self.slices.len() {
            return Err(MsiError::DimensionMismatch {
                expected: self.slices.len(),
                actual: output.depth(),
            });
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads.max(1))
            .build()
            .map_err(|e| MsiError::ThreadPool(e.to_string()))?;
        let ranges = partition_ranges(self.slices.len(), self.threads);

        let target = Mutex::new(&mut *output);
        let report = Mutex::new(QueryReport::default());

        pool.install(|| {
            ranges.par_iter().for_each(|range| {
                for z in range.clone() {
                    let Some(slice) = self.slices[z].as_ref() else {
                        continue;
                    };
                    let result = extract_slice(slice, center, tolerance, config)
                        .and_then(|image| target.lock().write_layer(z, &image));
                    match result {
                        Ok(()) => report.lock().written.push(z),
                        Err(e) => {
                            error!("Slice {}: ion image at {} failed: {}", z, center, e);
                            report.lock().failures.push((z, e));
                        }
                    }
                }
            });
        });

        drop(target);
        output.mark_modified();

        let mut report = report.into_inner();
        report.written.sort_unstable();
        report.failures.sort_by_key(|(z, _)| *z);
        info!(
            "Ion image at {}: {} layers written, {} failed",
            center,
            report.written.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// [`SliceStack::get_image`] into the stack's own volume with the stack's processing settings.
    pub fn update_volume(&mut self, center: f64, tolerance: f64) -> Result<QueryReport> {
        let mut volume = mem::take(&mut self.volume);
        let result = self.get_image(center, tolerance, &self.processing, &mut volume);
        self.volume = volume;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msicore::data::continuous::ContinuousSpectrumImage;
    use msicore::data::spectral_image::SpectralImage;
    use nalgebra::Vector3;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    const WIDTH: usize = 4;
    const HEIGHT: usize = 3;

    fn random_slice(rng: &mut StdRng) -> (RegistrationOrchestrator, Arc<ContinuousSpectrumImage>) {
        let x_axis: Vec<f64> = (0..50).map(|i| 100.0 + i as f64).collect();
        let spectra = (0..WIDTH * HEIGHT)
            .map(|_| (0..x_axis.len()).map(|_| rng.gen_range(0.0..100.0)).collect())
            .collect();
        let image = Arc::new(
            ContinuousSpectrumImage::new(WIDTH, HEIGHT, Vector3::new(1.0, 1.0, 1.0), Vector3::zeros(), x_axis, spectra)
                .unwrap(),
        );
        let mut orchestrator = RegistrationOrchestrator::new();
        orchestrator
            .set_image_data(Arc::new(image.image().clone()), image.clone())
            .unwrap();
        (orchestrator, image)
    }

    fn output(depth: usize) -> ImageVolume {
        ImageVolume::zeros(&[WIDTH, HEIGHT, depth], Vector3::new(1.0, 1.0, 1.0), Vector3::zeros(), PixelType::Float)
            .unwrap()
    }

    #[test]
    fn test_partition_covers_range() {
        for n in 0..20 {
            for workers in 1..10 {
                let ranges = partition_ranges(n, workers);
                assert!(ranges.len() <= workers);
                let flat: Vec<usize> = ranges.iter().cloned().flatten().collect();
                assert_eq!(flat, (0..n).collect::<Vec<_>>());
            }
        }
        assert_eq!(partition_ranges(5, 2), vec![0..3, 3..5]);
        assert_eq!(partition_ranges(3, 0), vec![0..3]);
    }

    #[test]
    fn test_concurrent_query_matches_sequential() {
        let mut rng = StdRng::seed_from_u64(42);
        let n = 7;
        let mut stack = SliceStack::new(n, 2.0);
        let mut images = Vec::new();
        for z in 0..n {
            let (slice, image) = random_slice(&mut rng);
            stack.insert(z, slice).unwrap();
            images.push(image);
        }
        let config = ProcessingConfig::default();

        let mut expected = output(n);
        for (z, image) in images.iter().enumerate() {
            let mut scratch = image.image().like(PixelType::Float);
            image.ion_image(120.0, 3.0, &config, &mut scratch).unwrap();
            expected.write_layer(z, &scratch).unwrap();
        }

        for threads in [1, 2, 3, 8, 16] {
            stack.set_threads(threads);
            let mut volume = output(n);
            let report = stack.get_image(120.0, 3.0, &config, &mut volume).unwrap();
            assert!(report.is_complete());
            assert_eq!(report.written, (0..n).collect::<Vec<_>>());
            assert_eq!(volume.data(), expected.data(), "threads = {}", threads);
            assert_eq!(volume.generation(), 1);
        }
    }

    #[test]
    fn test_failing_slice_does_not_stop_siblings() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut stack = SliceStack::new(3, 1.0);
        for z in 0..3 {
            stack.insert(z, random_slice(&mut rng).0).unwrap();
        }
        // a layer with a different in-plane size makes the copy of every slice fail ...
        let mut narrow = ImageVolume::zeros(&[WIDTH, HEIGHT - 1, 3], Vector3::new(1.0, 1.0, 1.0), Vector3::zeros(), PixelType::Float).unwrap();
        let report = stack.get_image(120.0, 1.0, &ProcessingConfig::default(), &mut narrow).unwrap();
        assert_eq!(report.failures.len(), 3);
        assert!(report.failures.iter().all(|(_, e)| matches!(e, MsiError::DimensionMismatch { .. })));
        assert!(narrow.data().iter().all(|v| *v == 0.0));

        // ... while empty slots are skipped
        let mut sparse = SliceStack::new(3, 1.0);
        sparse.insert(1, random_slice(&mut rng).0).unwrap();
        let mut volume = output(3);
        let report = sparse.get_image(120.0, 1.0, &ProcessingConfig::default(), &mut volume).unwrap();
        assert_eq!(report.written, vec![1]);
        assert!(volume.layer(0).unwrap().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_output_too_shallow() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut stack = SliceStack::new(2, 1.0);
        stack.insert(0, random_slice(&mut rng).0).unwrap();
        let mut volume = output(1);
        assert!(matches!(
            stack.get_image(120.0, 1.0, &ProcessingConfig::default(), &mut volume),
            Err(MsiError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_update_volume_after_geometry() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut stack = SliceStack::new(2, 1.0);
        for z in 0..2 {
            stack.insert(z, random_slice(&mut rng).0).unwrap();
        }
        stack.initialize_geometry().unwrap();
        let report = stack.update_volume(110.0, 0.5).unwrap();
        assert_eq!(report.written, vec![0, 1]);
        assert_eq!(stack.volume().sizes(), &[WIDTH, HEIGHT, 2]);
        assert_eq!(stack.volume().generation(), 2);
    }
}
