use std::cmp::Ordering;
use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{MsiError, Result};

/// Storage layout of the spectra of a spectral image.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SpectrumFormat {
    ContinuousProfile,
    ProcessedProfile,
    ContinuousCentroid,
    ProcessedCentroid,
    Unknown,
}

impl Default for SpectrumFormat {
    fn default() -> Self {
        SpectrumFormat::Unknown
    }
}

impl Display for SpectrumFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SpectrumFormat::ContinuousProfile => write!(f, "ContinuousProfile"),
            SpectrumFormat::ProcessedProfile => write!(f, "ProcessedProfile"),
            SpectrumFormat::ContinuousCentroid => write!(f, "ContinuousCentroid"),
            SpectrumFormat::ProcessedCentroid => write!(f, "ProcessedCentroid"),
            SpectrumFormat::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Overview spectra of a spectral image: one shared axis and three channels.
///
/// # Description
///
/// `sum` holds the summed intensity over all pixels, `mean` the mean intensity and `max`
/// the skyline (per-coordinate maximum). All four vectors have equal length and `x_axis`
/// is sorted ascending.
///
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumSummary {
    pub x_axis: Vec<f64>,
    pub sum: Vec<f64>,
    pub mean: Vec<f64>,
    pub max: Vec<f64>,
}

impl SpectrumSummary {
    pub fn new(x_axis: Vec<f64>, sum: Vec<f64>, mean: Vec<f64>, max: Vec<f64>) -> Result<Self> {
        let n = x_axis.len();
        for (name, len) in [("sum", sum.len()), ("mean", mean.len()), ("max", max.len())] {
            if len != n {
                return Err(MsiError::InvalidInput(format!(
                    "{} channel has {} samples, x axis has {}",
                    name, len, n
                )));
            }
        }
        if let Some(i) = x_axis
            .windows(2)
            .position(|w| matches!(w[0].partial_cmp(&w[1]), None | Some(Ordering::Greater)))
        {
            return Err(MsiError::InvalidInput(format!(
                "x axis is not ascending at index {}: {} after {}",
                i + 1,
                x_axis[i + 1],
                x_axis[i]
            )));
        }
        Ok(SpectrumSummary { x_axis, sum, mean, max })
    }

    pub fn len(&self) -> usize {
        self.x_axis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x_axis.is_empty()
    }

    /// Smallest and largest coordinate of the axis.
    pub fn range(&self) -> Option<(f64, f64)> {
        if self.x_axis.is_empty() {
            return None;
        }
        Some(
            self.x_axis
                .iter()
                .fold((f64::MAX, f64::MIN), |(lo, hi), x| (lo.min(*x), hi.max(*x))),
        )
    }
}
