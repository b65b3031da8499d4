use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nalgebra::Vector3;
use regex::Regex;
use serde::{Deserialize, Serialize};

use msicore::algorithm::processing::{
    BaselineCorrection, ImageNormalization, ImageSmoothing, IntensityTransform, Normalization,
    ProcessingConfig, Smoothing,
};
use msicore::data::image::PixelType;
use msicore::error::{MsiError, Result};

/// Render a float with a `.` decimal separator and full round-trip precision.
///
/// Formatting never consults the process locale.
pub fn format_invariant(value: f64) -> String {
    format!("{}", value)
}

fn entry_regex() -> &'static Regex {
    static ENTRY: OnceLock<Regex> = OnceLock::new();
    ENTRY.get_or_init(|| Regex::new(r"^\s*\(\s*([A-Za-z0-9_.\-]+)\s*(.*?)\s*\)\s*(//.*)?$").unwrap())
}

#[derive(Clone, Debug, PartialEq)]
enum Line {
    Entry { key: String, value: String, original: Option<String> },
    Other(String),
}

/// Line-preserving model of the engine's `(Key value ...)` parameter text.
///
/// # Description
///
/// Lines that are not rewritten are written back byte for byte, rewritten entries are
/// rendered as `(Key value)`. Keys absent from the text are appended at the end.
///
#[derive(Clone, Debug, PartialEq)]
pub struct ParameterText {
    lines: Vec<Line>,
}

impl ParameterText {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|line| match entry_regex().captures(line) {
                Some(caps) => Line::Entry {
                    key: caps[1].to_string(),
                    value: caps[2].to_string(),
                    original: Some(line.to_string()),
                },
                None => Line::Other(line.to_string()),
            })
            .collect();
        ParameterText { lines }
    }

    /// Raw value text of the first entry named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Whitespace separated values of `key` with surrounding quotes removed.
    pub fn values(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            let mut values = Vec::new();
            let mut current = String::new();
            let mut quoted = false;
            for c in raw.chars() {
                match c {
                    '"' => quoted = !quoted,
                    c if c.is_whitespace() && !quoted => {
                        if !current.is_empty() {
                            values.push(std::mem::take(&mut current));
                        }
                    }
                    c => current.push(c),
                }
            }
            if !current.is_empty() {
                values.push(current);
            }
            values
        })
    }

    /// Numeric values of `key`.
    pub fn numbers(&self, key: &str) -> Result<Vec<f64>> {
        let values = self
            .values(key)
            .ok_or_else(|| MsiError::parameter(format!("missing parameter ({})", key)))?;
        values
            .iter()
            .map(|v| {
                v.parse::<f64>()
                    .map_err(|_| MsiError::parameter(format!("({} ...) holds non-numeric '{}'", key, v)))
            })
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Replace every entry named `key` with `value` (raw text, quote strings yourself).
    pub fn set(&mut self, key: &str, value: &str) {
        let mut found = false;
        for line in self.lines.iter_mut() {
            if let Line::Entry { key: k, value: v, original } = line {
                if k == key {
                    *v = value.to_string();
                    *original = None;
                    found = true;
                }
            }
        }
        if !found {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                original: None,
            });
        }
    }

    pub fn set_quoted(&mut self, key: &str, value: &str) {
        self.set(key, &format!("\"{}\"", value));
    }

    /// Serialize back to the engine's text format.
    pub fn render(&self) -> String {
        let mut text = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { original: Some(original), .. } => text.push_str(original),
                Line::Entry { key, value, original: None } => {
                    text.push('(');
                    text.push_str(key);
                    if !value.is_empty() {
                        text.push(' ');
                        text.push_str(value);
                    }
                    text.push(')');
                }
                Line::Other(other) => text.push_str(other),
            }
            text.push('\n');
        }
        text
    }
}

/// Registration parameters given either inline or as a path to a parameter file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ParameterSource {
    Inline(String),
    File(PathBuf),
}

impl ParameterSource {
    /// Treat `spec` as a file if it names an existing regular file, as inline text otherwise.
    pub fn resolve(spec: &str) -> Self {
        let path = Path::new(spec);
        if !spec.contains('\n') && path.is_file() {
            ParameterSource::File(path.to_path_buf())
        } else {
            ParameterSource::Inline(spec.to_string())
        }
    }

    pub fn load(&self) -> Result<String> {
        match self {
            ParameterSource::Inline(text) => Ok(text.clone()),
            ParameterSource::File(path) => Ok(std::fs::read_to_string(path)?),
        }
    }
}

/// Rewrite a registration parameter text so that corresponding points contribute a metric.
///
/// Multi-resolution setups switch to the multi-metric multi-resolution registration, all
/// others to the plain multi-metric registration.
pub fn enable_point_metric(text: &str) -> String {
    let mut params = ParameterText::parse(text);
    if text.contains("MultiResolution") {
        params.set_quoted("Registration", "MultiMetricMultiResolutionRegistration");
    } else {
        params.set_quoted("Registration", "MultiMetricRegistration");
    }
    params.set(
        "Metric",
        "\"AdvancedMattesMutualInformation\" \"CorrespondingPointsEuclideanDistanceMetric\"",
    );
    params.render()
}

/// Size after resampling an axis from `spacing` to `target_spacing`, keeping its extent.
pub fn resize_for_spacing(size: f64, spacing: f64, target_spacing: f64) -> f64 {
    (size * spacing) / target_spacing
}

/// Settings applied to each stage before the warp engine runs.
#[derive(Clone, Debug, PartialEq)]
pub struct WarpSettings {
    pub pixel_type: PixelType,
    pub interpolation_order: u8,
    pub target_spacing: Vector3<f64>,
}

/// One stage of a transform chain as produced by the alignment engine.
#[derive(Clone, Debug, PartialEq)]
pub struct TransformStage {
    params: ParameterText,
}

impl TransformStage {
    pub fn parse(text: &str) -> Self {
        TransformStage {
            params: ParameterText::parse(text),
        }
    }

    pub fn size(&self) -> Result<Vec<f64>> {
        self.params.numbers("Size")
    }

    pub fn spacing(&self) -> Result<Vec<f64>> {
        self.params.numbers("Spacing")
    }

    pub fn pixel_type(&self) -> Option<PixelType> {
        self.params
            .values("ResultImagePixelType")
            .and_then(|v| PixelType::from_engine_name(&v.join(" ")))
    }

    pub fn interpolation_order(&self) -> Option<u8> {
        self.params
            .values("FinalBSplineInterpolationOrder")
            .and_then(|v| v.first().and_then(|o| o.parse().ok()))
    }

    /// Predecessor parameter file, `None` for `"NoInitialTransform"` or an absent entry.
    pub fn initial_transform(&self) -> Option<String> {
        self.params
            .values("InitialTransformParametersFileName")
            .and_then(|v| v.into_iter().next())
            .filter(|v| v != "NoInitialTransform")
    }

    /// Produce the stage as it is handed to the warp engine.
    ///
    /// # Arguments
    ///
    /// * `settings` - result pixel type, B-spline order and target spacing
    /// * `predecessor` - file of the preceding rewritten stage, `None` for the first stage
    ///
    /// # Returns
    ///
    /// The rewritten stage; in-plane sizes follow `size * spacing / target_spacing`, a third
    /// axis is rewritten only if the stage carries one
    pub fn retarget(&self, settings: &WarpSettings, predecessor: Option<&Path>) -> Result<TransformStage> {
        let size = self.size()?;
        let spacing = self.spacing()?;
        if size.len() < 2 || spacing.len() < 2 {
            return Err(MsiError::parameter(format!(
                "transform stage needs at least two Size/Spacing values, got {:?} / {:?}",
                size, spacing
            )));
        }

        let axes = if size.len() >= 3 && spacing.len() >= 3 { 3 } else { 2 };
        let mut new_size = Vec::with_capacity(axes);
        let mut new_spacing = Vec::with_capacity(axes);
        for axis in 0..axes {
            let target = settings.target_spacing[axis];
            if target <= 0.0 || !target.is_finite() {
                return Err(MsiError::parameter(format!("invalid target spacing {}", target)));
            }
            let resized = resize_for_spacing(size[axis], spacing[axis], target).round().max(1.0);
            new_size.push((resized as u64).to_string());
            new_spacing.push(format_invariant(target));
        }

        let mut params = self.params.clone();
        params.set_quoted("ResultImagePixelType", settings.pixel_type.engine_name());
        params.set_quoted("ResampleInterpolator", "FinalBSplineInterpolatorFloat");
        params.set("FinalBSplineInterpolationOrder", &settings.interpolation_order.to_string());
        params.set("Spacing", &new_spacing.join(" "));
        params.set("Size", &new_size.join(" "));
        match predecessor {
            None => params.set_quoted("InitialTransformParametersFileName", "NoInitialTransform"),
            Some(path) => params.set_quoted(
                "InitialTransformParametersFileName",
                &path.to_string_lossy(),
            ),
        }
        Ok(TransformStage { params })
    }

    pub fn render(&self) -> String {
        self.params.render()
    }
}

/// Ordered stages of one registration result, composed through their initial transforms.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransformChain {
    stages: Vec<TransformStage>,
}

impl TransformChain {
    pub fn from_texts<S: AsRef<str>>(texts: &[S]) -> Self {
        TransformChain {
            stages: texts.iter().map(|t| TransformStage::parse(t.as_ref())).collect(),
        }
    }

    pub fn stages(&self) -> &[TransformStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// The stages as opaque parameter texts.
    pub fn texts(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.render()).collect()
    }
}

const PROCESSING_KEYS: [&str; 9] = [
    "baseline-correction",
    "baseline-correction-hw",
    "smoothing",
    "smoothing-hw",
    "normalization",
    "intensity-transformation",
    "image-smoothing",
    "image-smoothing-hw",
    "image-normalization",
];

fn strategy<T>(params: &ParameterText, key: &str, default: T, parse: fn(&str) -> Option<T>) -> Result<T> {
    match params.values(key).and_then(|v| v.into_iter().next()) {
        None => Ok(default),
        Some(name) => parse(&name)
            .ok_or_else(|| MsiError::parameter(format!("unknown value '{}' for ({})", name, key))),
    }
}

fn half_window(params: &ParameterText, key: &str, default: usize) -> Result<usize> {
    match params.values(key).and_then(|v| v.into_iter().next()) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| MsiError::parameter(format!("({}) expects a non-negative integer, got '{}'", key, v))),
    }
}

/// Read a processing configuration from `(key value)` parameter text; missing keys keep defaults.
pub fn processing_config_from_text(text: &str) -> Result<ProcessingConfig> {
    let params = ParameterText::parse(text);
    let defaults = ProcessingConfig::default();
    Ok(ProcessingConfig {
        baseline_correction: strategy(&params, PROCESSING_KEYS[0], defaults.baseline_correction, BaselineCorrection::from_name)?,
        baseline_half_window: half_window(&params, PROCESSING_KEYS[1], defaults.baseline_half_window)?,
        smoothing: strategy(&params, PROCESSING_KEYS[2], defaults.smoothing, Smoothing::from_name)?,
        smoothing_half_window: half_window(&params, PROCESSING_KEYS[3], defaults.smoothing_half_window)?,
        normalization: strategy(&params, PROCESSING_KEYS[4], defaults.normalization, Normalization::from_name)?,
        intensity_transform: strategy(&params, PROCESSING_KEYS[5], defaults.intensity_transform, IntensityTransform::from_name)?,
        image_smoothing: strategy(&params, PROCESSING_KEYS[6], defaults.image_smoothing, ImageSmoothing::from_name)?,
        image_smoothing_half_window: half_window(&params, PROCESSING_KEYS[7], defaults.image_smoothing_half_window)?,
        image_normalization: strategy(&params, PROCESSING_KEYS[8], defaults.image_normalization, ImageNormalization::from_name)?,
    })
}

/// Write a processing configuration as `(key value)` parameter text.
pub fn processing_config_to_text(config: &ProcessingConfig) -> String {
    let values = [
        config.baseline_correction.name().to_string(),
        config.baseline_half_window.to_string(),
        config.smoothing.name().to_string(),
        config.smoothing_half_window.to_string(),
        config.normalization.name().to_string(),
        config.intensity_transform.name().to_string(),
        config.image_smoothing.name().to_string(),
        config.image_smoothing_half_window.to_string(),
        config.image_normalization.name().to_string(),
    ];
    PROCESSING_KEYS
        .iter()
        .zip(values.iter())
        .map(|(k, v)| format!("({} {})\n", k, v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGE: &str = "// transform written by the alignment engine\n\
(Transform \"EulerTransform\")\n\
(NumberOfParameters 3)\n\
(TransformParameters 0.01 1.5 -2.25)\n\
(InitialTransformParametersFileName \"NoInitialTransform\")\n\
(Size 100 50)\n\
(Spacing 2.0 2.0)\n\
(ResampleInterpolator \"FinalBSplineInterpolator\")\n\
(FinalBSplineInterpolationOrder 3)\n\
(ResultImagePixelType \"float\")\n";

    fn settings(spacing: f64) -> WarpSettings {
        WarpSettings {
            pixel_type: PixelType::Short,
            interpolation_order: 0,
            target_spacing: Vector3::new(spacing, spacing, 1.0),
        }
    }

    #[test]
    fn test_untouched_text_is_preserved() {
        assert_eq!(ParameterText::parse(STAGE).render(), STAGE);
    }

    #[test]
    fn test_retarget_rescales_size() {
        let stage = TransformStage::parse(STAGE);
        let warped = stage.retarget(&settings(1.0), None).unwrap();
        assert_eq!(warped.size().unwrap(), vec![200.0, 100.0]);
        assert_eq!(warped.spacing().unwrap(), vec![1.0, 1.0]);
        assert_eq!(warped.pixel_type(), Some(PixelType::Short));
        assert_eq!(warped.interpolation_order(), Some(0));
        assert_eq!(warped.initial_transform(), None);

        let text = warped.render();
        assert!(text.contains("(TransformParameters 0.01 1.5 -2.25)"));
        assert!(text.contains("(ResampleInterpolator \"FinalBSplineInterpolatorFloat\")"));
        assert!(text.starts_with("// transform written by the alignment engine\n"));
    }

    #[test]
    fn test_resize_is_scale_consistent() {
        assert!((resize_for_spacing(100.0, 2.0, 1.0) - 200.0).abs() < 1e-12);
        assert!((resize_for_spacing(33.0, 0.3, 0.1) - 99.0).abs() < 1e-9);
    }

    #[test]
    fn test_retarget_chains_predecessor() {
        let stage = TransformStage::parse(STAGE);
        let previous = Path::new("/tmp/work/TransformParameters.0.txt");
        let warped = stage.retarget(&settings(0.5), Some(previous)).unwrap();
        assert_eq!(warped.size().unwrap(), vec![400.0, 200.0]);
        assert_eq!(
            warped.initial_transform().as_deref(),
            Some("/tmp/work/TransformParameters.0.txt")
        );
    }

    #[test]
    fn test_retarget_requires_geometry() {
        let stage = TransformStage::parse("(Transform \"EulerTransform\")\n");
        assert!(matches!(stage.retarget(&settings(1.0), None), Err(MsiError::Parameter(_))));
    }

    #[test]
    fn test_point_metric_rewrite() {
        let text = "(Registration \"MultiResolutionRegistration\")\n(Metric \"AdvancedMattesMutualInformation\")\n";
        let rewritten = ParameterText::parse(&enable_point_metric(text));
        assert_eq!(
            rewritten.values("Registration").unwrap(),
            vec!["MultiMetricMultiResolutionRegistration"]
        );
        assert_eq!(
            rewritten.values("Metric").unwrap(),
            vec!["AdvancedMattesMutualInformation", "CorrespondingPointsEuclideanDistanceMetric"]
        );

        let plain = ParameterText::parse(&enable_point_metric("(Registration \"Plain\")\n"));
        assert_eq!(plain.values("Registration").unwrap(), vec!["MultiMetricRegistration"]);
    }

    #[test]
    fn test_processing_text() {
        let config = processing_config_from_text("(smoothing Gaussian)\n(smoothing-hw 4)\n(normalization TIC)\n").unwrap();
        assert_eq!(config.smoothing, Smoothing::Gaussian);
        assert_eq!(config.smoothing_half_window, 4);
        assert_eq!(config.normalization, Normalization::Tic);
        assert_eq!(config.baseline_half_window, 50);

        let text = processing_config_to_text(&config);
        assert_eq!(processing_config_from_text(&text).unwrap(), config);
        assert!(processing_config_from_text("(smoothing Wavelet)\n").is_err());
    }

    #[test]
    fn test_format_invariant() {
        assert_eq!(format_invariant(0.5), "0.5");
        assert_eq!(format_invariant(2.0), "2");
        assert_eq!(format_invariant(1e-7), "0.0000001");
    }
}
