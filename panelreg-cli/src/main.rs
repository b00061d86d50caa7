use clap::{Args, Parser, Subcommand, ValueEnum};
use panelreg::image::io::{load_channel_set, save_gray_u8, save_rgb_u8};
use panelreg::{
    AutomaskConfig, Blend, ChannelSet, CompositeTransform, Image, LevelReport, OutputMode,
    Projection, ResampleConfig, Resampled, Resampler, Registrar, RegistrationConfig,
    RegistrationResult, Transform, TransformFamily,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

const EXAMPLE_JSON: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/config.example.json"));

#[derive(Parser, Debug)]
#[command(author, version, about = "Registration of multi-channel microscopy panels")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Print an example registration config and exit.
    #[arg(long)]
    print_example: bool,
    /// Log at debug level instead of info.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate the transform mapping the fixed panel onto the moving panel.
    Register(RegisterArgs),
    /// Apply a transform to channel files.
    Resample(ResampleArgs),
}

#[derive(Args, Debug)]
struct PanelArgs {
    /// Physical sample spacing, one value per axis.
    #[arg(long, value_delimiter = ',')]
    spacing: Option<Vec<f64>>,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    /// Channel files of the fixed panel.
    #[arg(long, required = true, num_args = 1..)]
    fixed: Vec<PathBuf>,
    /// Channel files of the moving panel.
    #[arg(long, required = true, num_args = 1..)]
    moving: Vec<PathBuf>,
    #[command(flatten)]
    panel: PanelArgs,
    /// JSON config; command-line flags override its values.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// In-plane bin factor.
    #[arg(short, long)]
    bin: Option<usize>,
    /// Pyramid smoothing scale.
    #[arg(short, long)]
    sigma: Option<f64>,
    /// Estimate an affine instead of a rigid transform.
    #[arg(long)]
    affine: bool,
    /// Mask background before registering.
    #[arg(long)]
    automask: bool,
    /// Optimize with spacing scaled near unit magnitude.
    #[arg(long)]
    ignore_spacing: bool,
    /// Draw a random seed.
    #[arg(long, conflicts_with = "seed")]
    random: bool,
    /// Seed for sampling.
    #[arg(long)]
    seed: Option<u64>,
    /// Metric samples per transform parameter.
    #[arg(long)]
    samples_per_parameter: Option<usize>,
    /// Output JSON path; stdout when omitted.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BlendArg {
    Overlay,
    Sum,
    Max,
}

impl From<BlendArg> for Blend {
    fn from(value: BlendArg) -> Self {
        match value {
            BlendArg::Overlay => Blend::Overlay,
            BlendArg::Sum => Blend::Sum,
            BlendArg::Max => Blend::Max,
        }
    }
}

#[derive(Args, Debug)]
struct ResampleArgs {
    /// Transform JSON written by `register`, or a bare transform; several
    /// files are chained in the order given.
    #[arg(short, long, value_name = "FILE", required = true, num_args = 1..)]
    transform: Vec<PathBuf>,
    /// Channel files defining the target grid; first set in fusion mode.
    #[arg(long, required = true, num_args = 1..)]
    fixed: Vec<PathBuf>,
    /// Channel files to resample.
    #[arg(long, required = true, num_args = 1..)]
    moving: Vec<PathBuf>,
    #[command(flatten)]
    panel: PanelArgs,
    /// In-plane bin factor.
    #[arg(short, long, default_value_t = 1)]
    bin: usize,
    /// Write an RGB overlay of the fixed and resampled panels.
    #[arg(long, conflicts_with = "combine")]
    fusion: bool,
    /// Blend the resampled channels into one image.
    #[arg(long, value_enum)]
    combine: Option<BlendArg>,
    /// Apply the inverse transform.
    #[arg(long)]
    invert: bool,
    /// Collapse volumes along their thinnest axis.
    #[arg(long)]
    projection: bool,
    /// Output file, or stem for one file per channel.
    #[arg(short, long, value_name = "FILE")]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct LevelRecord {
    factor: usize,
    iterations: usize,
    start_metric: f64,
    end_metric: f64,
    stop: String,
}

impl From<&LevelReport> for LevelRecord {
    fn from(value: &LevelReport) -> Self {
        Self {
            factor: value.factor,
            iterations: value.iterations,
            start_metric: value.start_metric,
            end_metric: value.end_metric,
            stop: format!("{:?}", value.stop),
        }
    }
}

#[derive(Debug, Serialize)]
struct Output {
    transform: Transform,
    metric: f64,
    start: Transform,
    coarse: Transform,
    coarse_confidence: f64,
    seed: u64,
    levels: Vec<LevelRecord>,
    warnings: Vec<String>,
}

impl Output {
    fn new(result: &RegistrationResult, seed: u64) -> Self {
        Self {
            transform: result.transform.clone(),
            metric: result.metric,
            start: result.start.clone(),
            coarse: result.coarse.transform.clone(),
            coarse_confidence: result.coarse.confidence,
            seed,
            levels: result.levels.iter().map(LevelRecord::from).collect(),
            warnings: result.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TransformFile {
    Record { transform: Transform },
    Bare(Transform),
}

impl From<TransformFile> for Transform {
    fn from(value: TransformFile) -> Self {
        match value {
            TransformFile::Record { transform } | TransformFile::Bare(transform) => transform,
        }
    }
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() -> CliResult<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "panelreg=debug" } else { "panelreg=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if cli.print_example {
        println!("{EXAMPLE_JSON}");
        return Ok(());
    }

    match cli.command {
        Some(Command::Register(args)) => register(args),
        Some(Command::Resample(args)) => resample(args),
        None => Err("a subcommand is required (register or resample)".into()),
    }
}

fn load_panel(paths: &[PathBuf], panel: &PanelArgs) -> CliResult<ChannelSet> {
    let set = load_channel_set(paths)?;
    let Some(spacing) = &panel.spacing else {
        return Ok(set);
    };
    let geometry = set.geometry().with_spacing(spacing)?;
    let channels = set
        .channels()
        .iter()
        .map(|c| Image::new(c.data().to_vec(), geometry.clone()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ChannelSet::new(channels, set.encoding())?)
}

fn register(args: RegisterArgs) -> CliResult<()> {
    let mut config = match &args.config {
        Some(path) => serde_json::from_str::<RegistrationConfig>(&fs::read_to_string(path)?)?,
        None => RegistrationConfig::default(),
    };
    if let Some(bin) = args.bin {
        config.bin = bin;
    }
    if let Some(sigma) = args.sigma {
        config.sigma = sigma;
    }
    if let Some(spp) = args.samples_per_parameter {
        config.samples_per_parameter = spp;
    }
    if args.affine {
        config.family = TransformFamily::Affine;
    }
    if args.automask {
        config.automask = AutomaskConfig {
            enabled: true,
            ..config.automask
        };
    }
    if args.ignore_spacing {
        config.ignore_spacing = true;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if args.random {
        config.seed = rand::random();
    }
    config.validate()?;

    let fixed = load_panel(&args.fixed, &args.panel)?;
    let moving = load_panel(&args.moving, &args.panel)?;
    tracing::info!(
        fixed_channels = fixed.len(),
        moving_channels = moving.len(),
        seed = config.seed,
        "registering"
    );
    let seed = config.seed;
    let result = Registrar::new(config).register(&fixed, &moving)?;
    let json = serde_json::to_string_pretty(&Output::new(&result, seed))?;

    match args.output {
        Some(path) => fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

fn resample(args: ResampleArgs) -> CliResult<()> {
    let mut chain = CompositeTransform::new();
    for path in &args.transform {
        let text = fs::read_to_string(path)?;
        chain.push(serde_json::from_str::<TransformFile>(&text)?.into())?;
    }
    let transform = chain.flatten()?;
    let fixed = load_panel(&args.fixed, &args.panel)?;
    let moving = load_panel(&args.moving, &args.panel)?;

    let output = if args.fusion {
        OutputMode::Fusion
    } else if let Some(blend) = args.combine {
        OutputMode::Combine(blend.into())
    } else {
        OutputMode::Separate
    };
    let resampler = Resampler::new(ResampleConfig {
        invert: args.invert,
        bin: args.bin,
        projection: args.projection.then(Projection::default),
        output,
        ..ResampleConfig::default()
    });
    let sets: Vec<&ChannelSet> = match output {
        OutputMode::Fusion => vec![&fixed, &moving],
        _ => vec![&moving],
    };
    let target = fixed.geometry().clone();

    match resampler.resample(&transform, &target, &sets)? {
        Resampled::Separate(images) => {
            let scale = 255.0 / moving.encoding().max_value();
            for (index, image) in images.iter().enumerate() {
                let path = numbered(&args.output, index);
                save_gray_u8(&scaled(image, scale)?, &path)?;
                tracing::info!(path = %path.display(), "wrote channel");
            }
        }
        Resampled::Combined(image) => {
            save_gray_u8(&scaled(&image, 255.0)?, &args.output)?;
        }
        Resampled::Fusion([r, g, b]) => {
            save_rgb_u8([&r, &g, &b], &args.output)?;
        }
    }
    Ok(())
}

fn scaled(image: &Image, scale: f32) -> CliResult<Image> {
    let data = image.data().iter().map(|v| v * scale).collect();
    Ok(Image::new(data, image.geometry().clone())?)
}

/// `out.png` becomes `out_0.png`, `out_1.png`, ...
fn numbered(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{index}"),
    };
    path.with_file_name(name)
}
