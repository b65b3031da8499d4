use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use log::{error, info};

use msicore::algorithm::processing::ProcessingConfig;
use msicore::data::image::PixelType;
use msistack::config::StackConfig;
use msistack::exchange::nrrd::{read_nrrd, write_nrrd};
use msistack::exchange::parameters::{processing_config_to_text, ParameterSource, TransformChain};
use msistack::exchange::points::read_point_set;
use msistack::registration::orchestrator::RegistrationOrchestrator;
use msistack::{MsiError, Result};

#[derive(Parser)]
#[command(name = "msistack")]
#[command(about = "Register MSI slices with elastix and apply the transforms with transformix")]
struct Cli {
    /// Log level specification, e.g. `info` or `msistack=debug`
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a moving image onto a fixed image
    Register {
        /// Fixed image (NRRD)
        #[arg(long)]
        fixed: PathBuf,
        /// Moving image (NRRD)
        #[arg(long)]
        moving: PathBuf,
        /// Fixed mask (NRRD), used together with --moving-mask
        #[arg(long, requires = "moving_mask")]
        fixed_mask: Option<PathBuf>,
        /// Moving mask (NRRD)
        #[arg(long, requires = "fixed_mask")]
        moving_mask: Option<PathBuf>,
        /// Fixed landmarks (elastix point file), used together with --moving-points
        #[arg(long, requires = "moving_points")]
        fixed_points: Option<PathBuf>,
        /// Moving landmarks (elastix point file)
        #[arg(long, requires = "fixed_points")]
        moving_points: Option<PathBuf>,
        /// Registration parameter file, repeat for multiple stages
        #[arg(short, long)]
        parameters: Vec<PathBuf>,
        /// Stack configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Directory receiving TransformParameters.{i}.txt
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Warp an image with a previously computed transform chain
    Warp {
        /// Image defining the target spacing, i.e. the moving image of the registration
        #[arg(long)]
        reference: PathBuf,
        /// Image to warp (NRRD)
        #[arg(long)]
        input: PathBuf,
        /// Transform stages in order
        #[arg(short, long, required = true)]
        transform: Vec<PathBuf>,
        /// Output pixel type (uchar, short, ushort, int, float, double)
        #[arg(long, default_value = "float")]
        pixel_type: String,
        /// B-spline interpolation order, 0 for label images
        #[arg(long, default_value_t = 3)]
        order: u8,
        /// Stack configuration (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Warped image (NRRD)
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Write a stack configuration with all defaults
    SampleConfig {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a processing parameter file with all defaults
    SampleProcessing {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn setup_logging(level: &str) -> Result<LoggerHandle> {
    Logger::try_with_str(level)
        .and_then(|logger| logger.log_to_stderr().start())
        .map_err(|e| MsiError::Config(format!("logger initialization failed: {}", e)))
}

fn load_config(path: Option<&Path>) -> Result<StackConfig> {
    match path {
        Some(path) => StackConfig::from_json_file(path),
        None => Ok(StackConfig::default()),
    }
}

fn write_or_print(output: Option<&Path>, text: &str) -> Result<()> {
    match output {
        Some(path) => {
            fs::write(path, text)?;
            info!("Written {}", path.display());
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Register {
            fixed,
            moving,
            fixed_mask,
            moving_mask,
            fixed_points,
            moving_points,
            parameters,
            config,
            output,
        } => {
            let config = load_config(config.as_deref())?;
            let mut orchestrator = RegistrationOrchestrator::from_config(&config.registration);
            orchestrator.set_image_data(Arc::new(read_nrrd(&fixed)?), read_nrrd(&moving)?)?;

            if let (Some(fixed_mask), Some(moving_mask)) = (fixed_mask, moving_mask) {
                orchestrator.set_mask_data(
                    Some(Arc::new(read_nrrd(&fixed_mask)?)),
                    Some(Arc::new(read_nrrd(&moving_mask)?)),
                )?;
            }
            if let (Some(fixed_points), Some(moving_points)) = (fixed_points, moving_points) {
                orchestrator.set_point_data(
                    Some(Arc::new(read_point_set(&fixed_points)?)),
                    Some(Arc::new(read_point_set(&moving_points)?)),
                );
            }
            if !parameters.is_empty() {
                orchestrator.set_registration_parameters(parameters.into_iter().map(ParameterSource::File).collect());
            }

            orchestrator.get_registration()?;

            fs::create_dir_all(&output)?;
            for (i, text) in orchestrator.transformation_texts().iter().enumerate() {
                let path = output.join(format!("TransformParameters.{}.txt", i));
                fs::write(&path, text)?;
                info!("Written {}", path.display());
            }
            Ok(())
        }
        Commands::Warp {
            reference,
            input,
            transform,
            pixel_type,
            order,
            config,
            output,
        } => {
            let config = load_config(config.as_deref())?;
            let pixel_type = PixelType::from_engine_name(&pixel_type)
                .ok_or_else(|| MsiError::InvalidInput(format!("unknown pixel type '{}'", pixel_type)))?;

            let reference = Arc::new(read_nrrd(&reference)?);
            let mut orchestrator = RegistrationOrchestrator::from_config(&config.registration);
            orchestrator.set_image_data(reference.clone(), reference)?;

            let texts = transform
                .iter()
                .map(fs::read_to_string)
                .collect::<std::io::Result<Vec<String>>>()?;
            orchestrator.set_transformation(TransformChain::from_texts(&texts));

            let warped = orchestrator.warp_image(&read_nrrd(&input)?, pixel_type, order)?;
            write_nrrd(&output, &warped)?;
            info!("Written {} {}", output.display(), warped.shape_string());
            Ok(())
        }
        Commands::SampleConfig { output } => write_or_print(output.as_deref(), &StackConfig::default().to_json()?),
        Commands::SampleProcessing { output } => {
            write_or_print(output.as_deref(), &processing_config_to_text(&ProcessingConfig::default()))
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let _logger = match setup_logging(&cli.log_level) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(2);
        }
    };

    if let Err(e) = run(cli.command) {
        error!("{}", e);
        process::exit(1);
    }
}
