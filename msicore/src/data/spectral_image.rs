use std::sync::Arc;

use crate::algorithm::processing::ProcessingConfig;
use crate::data::image::ImageVolume;
use crate::data::spectrum::{SpectrumFormat, SpectrumSummary};
use crate::error::Result;

/// Capability of a slice image that holds spectra and can synthesize ion images.
pub trait SpectralImage: Send + Sync {
    /// Display image defining the slice geometry.
    fn image(&self) -> &ImageVolume;

    /// Label image of valid pixels, same geometry as [`SpectralImage::image`].
    fn mask(&self) -> Option<&ImageVolume>;

    /// Overview spectra (axis, sum, mean, max) of the slice.
    fn summary(&self) -> &SpectrumSummary;

    fn format(&self) -> SpectrumFormat;

    /// Label of the spectral axis, e.g. `m/z`.
    fn axis_label(&self) -> &str;

    /// Smallest and largest coordinate of the spectral axis.
    fn x_range(&self) -> Option<(f64, f64)> {
        self.summary().range()
    }

    /// Synthesize the ion image for `center ± tolerance` into `target`.
    ///
    /// # Arguments
    ///
    /// * `center` - spectral coordinate, e.g. an m/z value
    /// * `tolerance` - half width of the integration window
    /// * `config` - processing settings for this query
    /// * `target` - scratch image with the geometry of [`SpectralImage::image`]
    ///
    fn ion_image(
        &self,
        center: f64,
        tolerance: f64,
        config: &ProcessingConfig,
        target: &mut ImageVolume,
    ) -> Result<()>;
}

/// A slice image as handed to registration and stacking.
///
/// Whether a slice carries spectra is decided when it is constructed, consumers ask via
/// [`SliceImage::spectral`] instead of inspecting concrete types.
#[derive(Clone)]
pub enum SliceImage {
    Plain(Arc<ImageVolume>),
    Spectral(Arc<dyn SpectralImage>),
}

impl SliceImage {
    /// The raster used for geometry and registration.
    pub fn volume(&self) -> &ImageVolume {
        match self {
            SliceImage::Plain(image) => image,
            SliceImage::Spectral(spectral) => spectral.image(),
        }
    }

    pub fn spectral(&self) -> Option<&Arc<dyn SpectralImage>> {
        match self {
            SliceImage::Plain(_) => None,
            SliceImage::Spectral(spectral) => Some(spectral),
        }
    }
}

impl From<ImageVolume> for SliceImage {
    fn from(image: ImageVolume) -> Self {
        SliceImage::Plain(Arc::new(image))
    }
}

impl From<Arc<ImageVolume>> for SliceImage {
    fn from(image: Arc<ImageVolume>) -> Self {
        SliceImage::Plain(image)
    }
}

impl<T: SpectralImage + 'static> From<Arc<T>> for SliceImage {
    fn from(image: Arc<T>) -> Self {
        SliceImage::Spectral(image)
    }
}

impl std::fmt::Debug for SliceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceImage::Plain(image) => write!(f, "SliceImage::Plain({})", image.shape_string()),
            SliceImage::Spectral(s) => write!(
                f,
                "SliceImage::Spectral({}, {})",
                s.image().shape_string(),
                s.format()
            ),
        }
    }
}
