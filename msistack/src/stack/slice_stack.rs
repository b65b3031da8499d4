use log::{error, info, warn};
use nalgebra::Vector3;

use msicore::algorithm::binning::{bin_spectra, DEFAULT_BIN_COUNT};
use msicore::algorithm::processing::ProcessingConfig;
use msicore::data::image::{ImageVolume, PixelType};
use msicore::data::spectral_image::{SliceImage, SpectralImage};
use msicore::data::spectrum::{SpectrumFormat, SpectrumSummary};
use msicore::error::{MsiError, Result};

use crate::config::StackConfig;
use crate::registration::orchestrator::RegistrationOrchestrator;

/// B-spline order used when warping intensity images.
pub const INTENSITY_INTERPOLATION_ORDER: u8 = 3;
/// Nearest neighbor, keeps label values intact.
pub const LABEL_INTERPOLATION_ORDER: u8 = 0;

pub(crate) fn spectral_of(slice: &RegistrationOrchestrator) -> Result<&dyn SpectralImage> {
    let moving = slice
        .moving_image()
        .ok_or_else(|| MsiError::InvalidInput("slice has no moving image".to_string()))?;
    moving
        .spectral()
        .map(|s| s.as_ref())
        .ok_or_else(|| MsiError::TypeMismatch("moving image does not hold spectra".to_string()))
}

/// Intensity data of a slice in the common frame: warped if the slice carries a transform chain.
pub(crate) fn aligned(slice: &RegistrationOrchestrator, image: &ImageVolume, pixel_type: PixelType, order: u8) -> Result<ImageVolume> {
    if slice.transformation().is_empty() {
        let mut image = image.to_3d()?;
        if image.pixel_type() != pixel_type {
            let mut converted = image.like(pixel_type);
            converted.write_layer(0, &image)?;
            image = converted;
        }
        Ok(image)
    } else {
        slice.warp_image(image, pixel_type, order)
    }
}

/// Ordered set of registered MSI slices assembled into one volume.
///
/// # Description
///
/// Each slot holds the orchestrator of one slice; its moving image must carry spectra.
/// After all slots are filled, [`SliceStack::initialize_geometry`] allocates the volume
/// and the label volume, [`SliceStack::initialize_processor`] fixes the spectrum format and
/// [`SliceStack::initialize_image_access`] computes the global binned spectrum. Ion images
/// are then requested through [`SliceStack::get_image`].
///
pub struct SliceStack {
    pub(crate) slices: Vec<Option<RegistrationOrchestrator>>,
    spacing_z: f64,
    pub(crate) volume: ImageVolume,
    labels: ImageVolume,
    format: SpectrumFormat,
    global_spectrum: SpectrumSummary,
    x_range: Option<(f64, f64)>,
    axis_label: String,
    pub(crate) processing: ProcessingConfig,
    pub(crate) threads: usize,
    bins: usize,
}

impl SliceStack {
    /// Constructs a new `SliceStack`.
    ///
    /// # Arguments
    ///
    /// * `stack_size` - number of slots, one per z-layer
    /// * `spacing_z` - physical distance between adjacent slices
    ///
    pub fn new(stack_size: usize, spacing_z: f64) -> Self {
        SliceStack {
            slices: (0..stack_size).map(|_| None).collect(),
            spacing_z,
            volume: ImageVolume::default(),
            labels: ImageVolume::default(),
            format: SpectrumFormat::default(),
            global_spectrum: SpectrumSummary::default(),
            x_range: None,
            axis_label: String::new(),
            processing: ProcessingConfig::default(),
            threads: 8,
            bins: DEFAULT_BIN_COUNT,
        }
    }

    pub fn from_config(stack_size: usize, config: &StackConfig) -> Self {
        let mut stack = SliceStack::new(stack_size, config.spacing_z);
        stack.processing = config.processing.clone();
        stack.threads = config.threads;
        stack.bins = config.bins;
        stack
    }

    /// Place a slice at `slice_id`, extending the running spectral range.
    ///
    /// Every slot accepts exactly one slice, and the slice must carry spectra.
    pub fn insert(&mut self, slice_id: usize, slice: RegistrationOrchestrator) -> Result<()> {
        let len = self.slices.len();
        let slot = self
            .slices
            .get_mut(slice_id)
            .ok_or(MsiError::IndexOutOfRange { index: slice_id, len })?;
        if slot.is_some() {
            return Err(MsiError::SlotOccupied(slice_id));
        }

        let spectral = spectral_of(&slice)?;
        if let Some((lo, hi)) = spectral.x_range() {
            self.x_range = Some(match self.x_range {
                Some((min, max)) => (min.min(lo), max.max(hi)),
                None => (lo, hi),
            });
        }
        self.axis_label = spectral.axis_label().to_string();

        *slot = Some(slice);
        Ok(())
    }

    /// Allocate volume and label volume and copy every slice into its z-layer.
    ///
    /// In-plane geometry is taken from the (warped) first slice; the slice count and the
    /// configured slice spacing define the third axis. Intensity data is warped as `Float`
    /// with cubic B-spline interpolation, masks as `Short` with nearest neighbor.
    pub fn initialize_geometry(&mut self) -> Result<()> {
        let first = self.slices.first().and_then(|s| s.as_ref()).ok_or(MsiError::EmptySlot(0))?;
        let reference = aligned(
            first,
            spectral_of(first)?.image(),
            PixelType::Float,
            INTENSITY_INTERPOLATION_ORDER,
        )?;

        let spacing = Vector3::new(reference.spacing().x, reference.spacing().y, self.spacing_z);
        let sizes = [reference.size(0), reference.size(1), self.slices.len()];
        let mut volume = ImageVolume::zeros(&sizes, spacing, *reference.origin(), PixelType::Float)?;
        let mut labels = ImageVolume::zeros(&sizes, spacing, *reference.origin(), PixelType::Short)?;
        info!("Stack geometry {} spacing {:?}", volume.shape_string(), spacing.as_slice());

        for (z, slot) in self.slices.iter().enumerate() {
            let Some(slice) = slot else {
                warn!("Slot {} is empty, layer stays blank", z);
                continue;
            };
            let spectral = spectral_of(slice)?;

            let image = aligned(slice, spectral.image(), PixelType::Float, INTENSITY_INTERPOLATION_ORDER)?;
            volume.write_layer(z, &image)?;

            if let Some(mask) = spectral.mask() {
                let mask = aligned(slice, mask, PixelType::Short, LABEL_INTERPOLATION_ORDER)?;
                labels.write_layer(z, &mask)?;
            }
        }

        volume.mark_modified();
        labels.mark_modified();
        self.volume = volume;
        self.labels = labels;
        Ok(())
    }

    /// Adopt the spectrum format of the first slice; mismatching slices are only reported.
    pub fn initialize_processor(&mut self) {
        let mut formats = self
            .slices
            .iter()
            .enumerate()
            .filter_map(|(z, slot)| slot.as_ref().map(|s| (z, s)))
            .filter_map(|(z, slice)| match spectral_of(slice) {
                Ok(spectral) => Some((z, spectral.format())),
                Err(e) => {
                    error!("Slice {}: {}", z, e);
                    None
                }
            });

        let Some((_, format)) = formats.next() else {
            error!("No slices available to initialize the stack processor");
            return;
        };
        for (z, other) in formats {
            if other != format {
                error!("Slice {} has spectrum format {}, stack uses {}", z, other, format);
            }
        }
        self.format = format;
    }

    /// Merge the overview spectra of all slices into the global binned spectrum.
    ///
    /// The stack range is narrowed to the binned axis, which is what queries are offered on.
    pub fn initialize_image_access(&mut self) {
        let summaries: Vec<&SpectrumSummary> = self
            .slices
            .iter()
            .flatten()
            .filter_map(|slice| spectral_of(slice).ok())
            .map(|spectral| spectral.summary())
            .collect();
        let global = bin_spectra(&summaries, self.bins);
        if let Some(range) = global.range() {
            self.x_range = Some(range);
        }
        info!(
            "Global spectrum: {} of {} bins occupied over {:?}",
            global.len(),
            self.bins,
            self.x_range
        );
        self.global_spectrum = global;
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn slice(&self, slice_id: usize) -> Option<&RegistrationOrchestrator> {
        self.slices.get(slice_id).and_then(|s| s.as_ref())
    }

    /// Moving image of a slice, i.e. the data in its native frame.
    pub fn slice_image(&self, slice_id: usize) -> Option<&SliceImage> {
        self.slice(slice_id).and_then(|s| s.moving_image())
    }

    pub fn spacing_z(&self) -> f64 {
        self.spacing_z
    }

    pub fn volume(&self) -> &ImageVolume {
        &self.volume
    }

    pub fn labels(&self) -> &ImageVolume {
        &self.labels
    }

    pub fn format(&self) -> SpectrumFormat {
        self.format
    }

    pub fn global_spectrum(&self) -> &SpectrumSummary {
        &self.global_spectrum
    }

    /// Running minimum and maximum of the spectral axis over all inserted slices.
    pub fn x_range(&self) -> Option<(f64, f64)> {
        self.x_range
    }

    pub fn axis_label(&self) -> &str {
        &self.axis_label
    }

    pub fn processing(&self) -> &ProcessingConfig {
        &self.processing
    }

    pub fn set_processing(&mut self, processing: ProcessingConfig) {
        self.processing = processing;
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn set_threads(&mut self, threads: usize) {
        self.threads = threads;
    }

    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn set_bins(&mut self, bins: usize) {
        self.bins = bins;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msicore::data::continuous::ContinuousSpectrumImage;
    use std::sync::Arc;

    fn spectral_slice(x_axis: Vec<f64>, width: usize, height: usize, value: f64) -> RegistrationOrchestrator {
        let spectra = vec![vec![value; x_axis.len()]; width * height];
        let image = ContinuousSpectrumImage::new(
            width,
            height,
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::zeros(),
            x_axis,
            spectra,
        )
        .unwrap();
        let fixed = Arc::new(image.image().clone());
        let mut orchestrator = RegistrationOrchestrator::new();
        orchestrator.set_image_data(fixed, Arc::new(image)).unwrap();
        orchestrator
    }

    #[test]
    fn test_insert_tracks_true_range() {
        let mut stack = SliceStack::new(3, 10.0);
        stack.insert(1, spectral_slice(vec![300.0, 400.0], 2, 2, 1.0)).unwrap();
        stack.insert(0, spectral_slice(vec![150.0, 350.0], 2, 2, 1.0)).unwrap();
        stack.insert(2, spectral_slice(vec![200.0, 900.0], 2, 2, 1.0)).unwrap();
        assert_eq!(stack.x_range(), Some((150.0, 900.0)));
        assert_eq!(stack.axis_label(), "m/z");
    }

    #[test]
    fn test_insert_rejects_bad_slots_and_plain_images() {
        let mut stack = SliceStack::new(1, 1.0);
        assert!(matches!(
            stack.insert(1, spectral_slice(vec![1.0], 1, 1, 1.0)),
            Err(MsiError::IndexOutOfRange { index: 1, len: 1 })
        ));
        stack.insert(0, spectral_slice(vec![1.0], 1, 1, 1.0)).unwrap();
        assert!(matches!(
            stack.insert(0, spectral_slice(vec![1.0], 1, 1, 1.0)),
            Err(MsiError::SlotOccupied(0))
        ));

        let mut plain = RegistrationOrchestrator::new();
        let image = Arc::new(ImageVolume::zeros(&[2, 2], Vector3::new(1.0, 1.0, 1.0), Vector3::zeros(), PixelType::Float).unwrap());
        plain.set_image_data(image.clone(), image).unwrap();
        let mut stack = SliceStack::new(1, 1.0);
        assert!(matches!(stack.insert(0, plain), Err(MsiError::TypeMismatch(_))));
    }

    #[test]
    fn test_geometry_without_transforms() {
        let mut stack = SliceStack::new(2, 5.0);
        stack.insert(0, spectral_slice(vec![1.0, 2.0], 3, 2, 1.0)).unwrap();
        stack.insert(1, spectral_slice(vec![1.0, 2.0], 3, 2, 2.0)).unwrap();
        stack.initialize_geometry().unwrap();

        let volume = stack.volume();
        assert_eq!(volume.sizes(), &[3, 2, 2]);
        assert_eq!(volume.spacing().z, 5.0);
        assert!(volume.layer(0).unwrap().iter().all(|v| *v == 2.0));
        assert!(volume.layer(1).unwrap().iter().all(|v| *v == 4.0));
        assert_eq!(stack.labels().pixel_type(), PixelType::Short);
        assert_eq!(volume.generation(), 1);
    }

    #[test]
    fn test_geometry_fails_on_in_plane_mismatch() {
        let mut stack = SliceStack::new(2, 1.0);
        stack.insert(0, spectral_slice(vec![1.0], 3, 2, 1.0)).unwrap();
        stack.insert(1, spectral_slice(vec![1.0], 2, 2, 1.0)).unwrap();
        assert!(matches!(
            stack.initialize_geometry(),
            Err(MsiError::DimensionMismatch { expected: 6, actual: 4 })
        ));
    }

    #[test]
    fn test_geometry_requires_first_slice() {
        let mut stack = SliceStack::new(2, 1.0);
        stack.insert(1, spectral_slice(vec![1.0], 1, 1, 1.0)).unwrap();
        assert!(matches!(stack.initialize_geometry(), Err(MsiError::EmptySlot(0))));
    }

    #[test]
    fn test_processor_and_image_access() {
        let mut stack = SliceStack::new(2, 1.0);
        stack.initialize_processor();
        assert_eq!(stack.format(), SpectrumFormat::Unknown);

        stack.insert(0, spectral_slice(vec![100.0, 200.0], 1, 1, 4.0)).unwrap();
        stack.insert(1, spectral_slice(vec![100.0, 200.0], 1, 1, 6.0)).unwrap();
        stack.initialize_processor();
        assert_eq!(stack.format(), SpectrumFormat::ContinuousProfile);

        stack.set_bins(10);
        stack.initialize_image_access();
        let global = stack.global_spectrum();
        assert_eq!(global.x_axis, vec![100.0, 200.0]);
        assert_eq!(global.sum, vec![5.0, 5.0]);
        assert_eq!(global.max, vec![6.0, 6.0]);
    }

    #[test]
    fn test_image_access_narrows_range_to_binned_axis() {
        let mut stack = SliceStack::new(2, 1.0);
        stack.insert(0, spectral_slice(vec![100.0, 101.0, 102.0], 1, 1, 1.0)).unwrap();
        stack.insert(1, spectral_slice(vec![150.0, 152.0], 1, 1, 1.0)).unwrap();
        assert_eq!(stack.x_range(), Some((100.0, 152.0)));

        stack.set_bins(2);
        stack.initialize_image_access();
        let global = stack.global_spectrum();
        assert_eq!(global.x_axis, vec![101.0, 151.0]);
        assert_eq!(stack.x_range(), Some((global.x_axis[0], global.x_axis[1])));
    }

    #[test]
    fn test_slice_image_is_the_moving_image() {
        let mut stack = SliceStack::new(3, 1.0);
        stack.insert(1, spectral_slice(vec![1.0, 2.0], 3, 2, 1.0)).unwrap();
        assert!(stack.slice_image(0).is_none());
        assert!(stack.slice_image(5).is_none());

        let image = stack.slice_image(1).unwrap();
        assert!(image.spectral().is_some());
        assert_eq!(image.volume().size(0), 3);
        assert_eq!(image.volume().size(1), 2);
        assert!(image.volume().data().iter().all(|v| *v == 2.0));
    }
}
