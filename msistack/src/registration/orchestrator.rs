use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use msicore::data::image::{ImageVolume, PixelType};
use msicore::data::points::PointSet;
use msicore::data::spectral_image::SliceImage;
use msicore::error::{MsiError, Result};

use crate::config::RegistrationConfig;
use crate::exchange::executable::{find_executable, ALIGNMENT_ENGINE, WARP_ENGINE};
use crate::exchange::nrrd::{read_nrrd, write_nrrd};
use crate::exchange::parameters::{
    enable_point_metric, ParameterSource, TransformChain, WarpSettings,
};
use crate::exchange::points::write_point_set;
use crate::exchange::workdir::WorkingDirectory;
use crate::registration::defaults;
use crate::registration::process::{CancellationToken, ExternalTask};

/// Receives human-readable progress messages.
pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;

fn check_geometry(image: &ImageVolume, mask: &ImageVolume, which: &str) -> Result<()> {
    if image.same_geometry(mask) {
        Ok(())
    } else {
        Err(MsiError::GeometryMismatch(format!(
            "{} image {} and {} mask {} differ; image and mask geometries have to be equal",
            which,
            image.shape_string(),
            which,
            mask.shape_string()
        )))
    }
}

/// Drives the external alignment engine for one fixed/moving pair and applies the
/// resulting transform chain to further images through the warp engine.
///
/// # Description
///
/// Images, masks and point sets are shared with the caller. Every call to
/// [`RegistrationOrchestrator::get_registration`] runs the engine again in a fresh working
/// directory and replaces the stored transform chain. Geometry mismatches between images
/// and masks are always reported as errors, regardless of the order in which images and
/// masks are set.
///
pub struct RegistrationOrchestrator {
    fixed_image: Option<Arc<ImageVolume>>,
    moving_image: Option<SliceImage>,
    fixed_mask: Option<Arc<ImageVolume>>,
    moving_mask: Option<Arc<ImageVolume>>,
    fixed_points: Option<Arc<PointSet>>,
    moving_points: Option<Arc<PointSet>>,
    parameters: Vec<ParameterSource>,
    search_path: Option<PathBuf>,
    working_directory: Option<PathBuf>,
    remove_working_directory: bool,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    status: StatusCallback,
    transformation: TransformChain,
}

impl Default for RegistrationOrchestrator {
    fn default() -> Self {
        RegistrationOrchestrator {
            fixed_image: None,
            moving_image: None,
            fixed_mask: None,
            moving_mask: None,
            fixed_points: None,
            moving_points: None,
            parameters: Vec::new(),
            search_path: None,
            working_directory: None,
            remove_working_directory: true,
            timeout: None,
            cancellation: None,
            status: Arc::new(|msg: &str| info!("{}", msg)),
            transformation: TransformChain::default(),
        }
    }
}

impl RegistrationOrchestrator {
    pub fn new() -> Self {
        RegistrationOrchestrator::default()
    }

    /// Orchestrator with search path, working directory, timeout and parameters taken from
    /// the configuration.
    pub fn from_config(config: &RegistrationConfig) -> Self {
        let mut orchestrator = RegistrationOrchestrator::new();
        orchestrator.search_path = config.search_path.clone();
        orchestrator.working_directory = config.working_directory.clone();
        orchestrator.remove_working_directory = config.remove_working_directory;
        orchestrator.timeout = config.timeout_secs.map(Duration::from_secs);
        orchestrator.parameters = config.parameters.iter().map(|p| ParameterSource::resolve(p)).collect();
        orchestrator
    }

    /// Set the fixed and moving image.
    ///
    /// Both images must be 2D or 3D; if masks were set before, their geometry has to
    /// match. Nothing is stored when a check fails.
    pub fn set_image_data(&mut self, fixed: Arc<ImageVolume>, moving: impl Into<SliceImage>) -> Result<()> {
        let moving = moving.into();
        fixed.check_dimensionality()?;
        moving.volume().check_dimensionality()?;

        if let (Some(fixed_mask), Some(moving_mask)) = (&self.fixed_mask, &self.moving_mask) {
            check_geometry(&fixed, fixed_mask, "fixed")?;
            check_geometry(moving.volume(), moving_mask, "moving")?;
        }

        self.fixed_image = Some(fixed);
        self.moving_image = Some(moving);
        Ok(())
    }

    /// Set the fixed and moving mask; if either is absent, masks are not used.
    pub fn set_mask_data(&mut self, fixed: Option<Arc<ImageVolume>>, moving: Option<Arc<ImageVolume>>) -> Result<()> {
        let (fixed, moving) = match (fixed, moving) {
            (Some(fixed), Some(moving)) => (fixed, moving),
            (fixed, moving) => {
                warn!(
                    "Fixed mask is {}; moving mask is {}. No masks are used.",
                    if fixed.is_some() { "set" } else { "absent" },
                    if moving.is_some() { "set" } else { "absent" }
                );
                self.fixed_mask = None;
                self.moving_mask = None;
                return Ok(());
            }
        };

        fixed.check_dimensionality()?;
        moving.check_dimensionality()?;

        if let (Some(fixed_image), Some(moving_image)) = (&self.fixed_image, &self.moving_image) {
            check_geometry(fixed_image, &fixed, "fixed")?;
            check_geometry(moving_image.volume(), &moving, "moving")?;
        }

        self.fixed_mask = Some(fixed);
        self.moving_mask = Some(moving);
        Ok(())
    }

    /// Set corresponding landmarks; if either is absent, point-based registration is off.
    pub fn set_point_data(&mut self, fixed: Option<Arc<PointSet>>, moving: Option<Arc<PointSet>>) {
        match (fixed, moving) {
            (Some(fixed), Some(moving)) => {
                if fixed.len() != moving.len() {
                    warn!(
                        "Fixed point set has {} points, moving point set has {}",
                        fixed.len(),
                        moving.len()
                    );
                }
                self.fixed_points = Some(fixed);
                self.moving_points = Some(moving);
            }
            _ => {
                warn!("Fixed or moving point set is absent. No point sets are used.");
                self.fixed_points = None;
                self.moving_points = None;
            }
        }
    }

    pub fn set_working_directory(&mut self, dir: Option<PathBuf>) {
        self.working_directory = dir;
    }

    pub fn set_registration_parameters(&mut self, parameters: Vec<ParameterSource>) {
        self.parameters = parameters;
    }

    pub fn set_additional_binary_search_path(&mut self, path: PathBuf) {
        self.search_path = Some(path);
    }

    pub fn set_status_callback<F>(&mut self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.status = Arc::new(callback);
    }

    pub fn set_remove_working_directory(&mut self, remove: bool) {
        self.remove_working_directory = remove;
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_cancellation_token(&mut self, token: Option<CancellationToken>) {
        self.cancellation = token;
    }

    /// Adopt a previously computed transform chain, e.g. one read back from disk.
    pub fn set_transformation(&mut self, chain: TransformChain) {
        self.transformation = chain;
    }

    pub fn fixed_image(&self) -> Option<&Arc<ImageVolume>> {
        self.fixed_image.as_ref()
    }

    pub fn moving_image(&self) -> Option<&SliceImage> {
        self.moving_image.as_ref()
    }

    pub fn uses_masks(&self) -> bool {
        self.fixed_mask.is_some() && self.moving_mask.is_some()
    }

    pub fn uses_points(&self) -> bool {
        self.fixed_points.is_some() && self.moving_points.is_some()
    }

    pub fn transformation(&self) -> &TransformChain {
        &self.transformation
    }

    /// The transform chain as opaque parameter texts, one per stage.
    pub fn transformation_texts(&self) -> Vec<String> {
        self.transformation.texts()
    }

    fn status(&self, msg: &str) {
        (self.status)(msg);
    }

    fn task(&self, executable: &Path) -> ExternalTask {
        ExternalTask::new(executable)
            .timeout(self.timeout)
            .cancellation(self.cancellation.clone())
    }

    /// Run the alignment engine and store the resulting transform chain.
    ///
    /// # Description
    ///
    /// Writes one parameter file per configured stage (the default rigid stage if none is
    /// configured), the 2D fixed and moving images and, when enabled, masks and point sets
    /// to the working directory. The engine is started with
    /// `-f -m -out [-fMask -mMask] [-fp -mp] -p ...` and awaited; afterwards one
    /// `TransformParameters.{i}.txt` per stage is read back.
    ///
    pub fn get_registration(&mut self) -> Result<()> {
        let (fixed, moving) = match (&self.fixed_image, &self.moving_image) {
            (Some(fixed), Some(moving)) => (fixed.clone(), moving.clone()),
            _ => {
                error!("No image set for registration!");
                return Err(MsiError::InvalidInput("fixed and moving image are required".to_string()));
            }
        };

        let executable = find_executable(ALIGNMENT_ENGINE, self.search_path.as_deref())?;
        self.transformation = TransformChain::default();

        let workdir = WorkingDirectory::create(self.working_directory.as_deref(), self.remove_working_directory)?;

        let parameters = if self.parameters.is_empty() {
            vec![ParameterSource::Inline(defaults::rigid())]
        } else {
            self.parameters.clone()
        };

        let mut parameter_files = Vec::with_capacity(parameters.len());
        for (i, source) in parameters.iter().enumerate() {
            let path = workdir.join(&format!("pp{}.txt", i));
            let mut text = source.load()?;
            if self.uses_points() {
                text = enable_point_metric(&text);
            }
            fs::write(&path, text)?;
            self.status(&format!("Parameter file written: {}", path.display()));
            parameter_files.push(path);
        }

        let fixed_path = workdir.join("fixed.nrrd");
        let moving_path = workdir.join("moving.nrrd");
        write_nrrd(&moving_path, &moving.volume().to_2d()?)?;
        self.status(&format!("Moving image written: {}", moving_path.display()));
        write_nrrd(&fixed_path, &fixed.to_2d()?)?;
        self.status(&format!("Fixed image written: {}", fixed_path.display()));

        let mut task = self
            .task(&executable)
            .flag("-f", &fixed_path)
            .flag("-m", &moving_path)
            .flag("-out", workdir.path());

        if let (Some(fixed_mask), Some(moving_mask)) = (&self.fixed_mask, &self.moving_mask) {
            let fixed_mask_path = workdir.join("fixedMask.nrrd");
            let moving_mask_path = workdir.join("movingMask.nrrd");
            write_nrrd(&moving_mask_path, &moving_mask.to_2d()?)?;
            write_nrrd(&fixed_mask_path, &fixed_mask.to_2d()?)?;
            task = task.flag("-fMask", &fixed_mask_path).flag("-mMask", &moving_mask_path);
        }

        if let (Some(fixed_points), Some(moving_points)) = (&self.fixed_points, &self.moving_points) {
            let fixed_points_path = workdir.join("fixedPoints.txt");
            let moving_points_path = workdir.join("movingPoints.txt");
            write_point_set(&moving_points_path, moving_points, 2)?;
            write_point_set(&fixed_points_path, fixed_points, 2)?;
            task = task.flag("-fp", &fixed_points_path).flag("-mp", &moving_points_path);
        }

        for path in &parameter_files {
            task = task.flag("-p", path);
        }

        self.status("Registration started ...");
        let outcome = task.run();
        self.status("Registration finished.");
        outcome.into_result(ALIGNMENT_ENGINE)?;

        let mut texts = Vec::with_capacity(parameter_files.len());
        for i in 0..parameter_files.len() {
            let path = workdir.join(&format!("TransformParameters.{}.txt", i));
            texts.push(fs::read_to_string(&path)?);
            info!("Read transformation: {}", path.display());
        }
        self.transformation = TransformChain::from_texts(&texts);
        self.status("Transformation parameters assimilated");
        Ok(())
    }

    /// Apply the stored transform chain to `data` with the warp engine.
    ///
    /// # Arguments
    ///
    /// * `data` - 2D or 3D image on the moving image grid
    /// * `pixel_type` - pixel type of the warped result (`Short` for label images)
    /// * `interpolation_order` - B-spline order of the final resampling, 0 for nearest neighbor
    ///
    /// # Returns
    ///
    /// The warped image as a 3D image; a unit-depth result keeps the slice thickness of `data`
    pub fn warp_image(&self, data: &ImageVolume, pixel_type: PixelType, interpolation_order: u8) -> Result<ImageVolume> {
        if self.transformation.is_empty() {
            return Err(MsiError::MissingTransform);
        }
        let executable = find_executable(WARP_ENGINE, self.search_path.as_deref())?;
        data.check_dimensionality()?;
        let moving = self
            .moving_image
            .as_ref()
            .ok_or_else(|| MsiError::InvalidInput("moving image is required to warp".to_string()))?;

        let workdir = WorkingDirectory::create(self.working_directory.as_deref(), self.remove_working_directory)?;
        self.status(&format!("Directory created: {}", workdir.path().display()));

        let image_path = workdir.join("data.nrrd");
        let result_path = workdir.join("result.nrrd");
        write_nrrd(&image_path, &data.to_2d()?)?;
        self.status(&format!("Moving image written: {}", image_path.display()));

        let settings = WarpSettings {
            pixel_type,
            interpolation_order,
            target_spacing: *moving.volume().spacing(),
        };

        let mut previous: Option<PathBuf> = None;
        for (i, stage) in self.transformation.stages().iter().enumerate() {
            let path = workdir.join(&format!("TransformParameters.{}.txt", i));
            let rewritten = stage.retarget(&settings, previous.as_deref())?;
            info!(
                "Warped image geometry: (size) {:?} (spacing) {:?}",
                rewritten.size()?,
                rewritten.spacing()?
            );
            fs::write(&path, rewritten.render())?;
            previous = Some(path);
        }
        let final_transform = previous.ok_or(MsiError::MissingTransform)?;

        let outcome = self
            .task(&executable)
            .flag("-in", &image_path)
            .flag("-tp", &final_transform)
            .flag("-out", workdir.path())
            .run();
        outcome.into_result(WARP_ENGINE)?;
        self.status(&format!("Image warped: {}", image_path.display()));

        let mut result = read_nrrd(&result_path)?.to_3d()?;
        if result.depth() == 1 {
            let mut spacing = *result.spacing();
            spacing.z = data.spacing().z;
            result.set_spacing(spacing);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    fn image(sizes: &[usize], spacing: f64) -> Arc<ImageVolume> {
        Arc::new(
            ImageVolume::zeros(sizes, Vector3::new(spacing, spacing, 1.0), Vector3::zeros(), PixelType::Float)
                .unwrap(),
        )
    }

    #[test]
    fn test_four_dimensional_images_are_rejected() {
        let mut orchestrator = RegistrationOrchestrator::new();
        let result = orchestrator.set_image_data(image(&[4, 4, 1], 1.0), image(&[4, 4, 2, 2], 1.0));
        assert!(matches!(result, Err(MsiError::DimensionalityUnsupported { .. })));
        assert!(orchestrator.moving_image().is_none());
    }

    #[test]
    fn test_geometry_mismatch_fails_in_either_order() {
        let mut masks_first = RegistrationOrchestrator::new();
        masks_first
            .set_mask_data(Some(image(&[4, 4], 1.0)), Some(image(&[4, 4], 1.0)))
            .unwrap();
        assert!(matches!(
            masks_first.set_image_data(image(&[4, 4], 1.0), image(&[5, 4], 1.0)),
            Err(MsiError::GeometryMismatch(_))
        ));

        let mut images_first = RegistrationOrchestrator::new();
        images_first
            .set_image_data(image(&[4, 4, 1], 1.0), image(&[4, 4, 1], 2.0))
            .unwrap();
        assert!(matches!(
            images_first.set_mask_data(Some(image(&[4, 4], 1.0)), Some(image(&[4, 4], 1.0))),
            Err(MsiError::GeometryMismatch(_))
        ));
        assert!(!images_first.uses_masks());
    }

    #[test]
    fn test_absent_masks_and_points_disable_features() {
        let mut orchestrator = RegistrationOrchestrator::new();
        orchestrator.set_mask_data(Some(image(&[4, 4], 1.0)), None).unwrap();
        assert!(!orchestrator.uses_masks());
        orchestrator.set_point_data(Some(Arc::new(PointSet::from_xy(&[(1.0, 1.0)]))), None);
        assert!(!orchestrator.uses_points());
    }

    #[test]
    fn test_registration_requires_images() {
        let mut orchestrator = RegistrationOrchestrator::new();
        assert!(matches!(orchestrator.get_registration(), Err(MsiError::InvalidInput(_))));
    }

    #[test]
    fn test_warp_requires_transformation() {
        let mut orchestrator = RegistrationOrchestrator::new();
        orchestrator.set_image_data(image(&[4, 4], 1.0), image(&[4, 4], 1.0)).unwrap();
        let data = image(&[4, 4], 1.0);
        assert!(matches!(
            orchestrator.warp_image(&data, PixelType::Float, 3),
            Err(MsiError::MissingTransform)
        ));
    }

    #[test]
    fn test_missing_engine_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let mut orchestrator = RegistrationOrchestrator::new();
        orchestrator.set_image_data(image(&[4, 4], 1.0), image(&[4, 4], 1.0)).unwrap();
        orchestrator.set_transformation(TransformChain::from_texts(&["(Size 4 4)\n(Spacing 1 1)\n"]));
        // a host installation on PATH would be found
        if find_executable(WARP_ENGINE, None).is_ok() {
            return;
        }
        orchestrator.set_additional_binary_search_path(dir.path().to_path_buf());
        let data = image(&[4, 4], 1.0);
        assert!(matches!(
            orchestrator.warp_image(&data, PixelType::Float, 3),
            Err(MsiError::ExecutableNotFound(_))
        ));
    }
}
