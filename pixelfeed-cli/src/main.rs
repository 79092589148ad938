use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Instant;

use pixelfeed::recordio::{ImageRecordHeader, RecordWriter};
use pixelfeed::{
    list_files, Error, FileListOptions, ImageFrame, ImageParams, ImageReader, LastBatchHandling,
    ReaderParams,
};

#[derive(Parser)]
#[command(name = "pixelfeed-cli")]
#[command(about = "Read image datasets into fixed-shape batches", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true, default_value_t)]
    verbose: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long, global = true, default_value_t)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Read every batch of a dataset and report tensor shapes
    Read(ReadArgs),
    /// Pack images into a RecordIO file
    Pack(PackArgs),
}

#[derive(Args)]
struct ReadArgs {
    /// Image files, containers or directories
    #[arg(value_name = "INPUTS", required = true)]
    inputs: Vec<PathBuf>,

    /// JSON file with image parameters; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How images are framed inside each input
    #[arg(long, value_enum)]
    frame: Option<FrameArg>,

    /// Scale the shorter edge to this length, then center-crop
    #[arg(long, value_name = "PIXELS")]
    resize: Option<u32>,

    /// Output image dimensions as CHANNELS,HEIGHT,WIDTH
    #[arg(long, value_name = "C,H,W", value_parser = parse_dims)]
    dims: Option<[u32; 3]>,

    /// Emit RGB instead of the decoder's BGR order
    #[arg(long, default_value_t)]
    to_rgb: bool,

    #[arg(short, long, value_name = "N", default_value_t = 1)]
    batch_size: usize,

    /// What to do with a final incomplete batch
    #[arg(long, value_enum, default_value_t = LastBatchArg::None)]
    last_batch: LastBatchArg,

    /// Instances to skip before reading
    #[arg(long, value_name = "N", default_value_t)]
    skip: usize,

    /// Maximum number of instances to read
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Decode the next batch in the background
    #[arg(long, default_value_t)]
    prefetch: bool,
}

#[derive(Args)]
struct PackArgs {
    /// RecordIO file to write
    #[arg(value_name = "OUTPUT")]
    output: PathBuf,

    /// Image files or directories
    #[arg(value_name = "IMAGES", required = true)]
    images: Vec<PathBuf>,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum FrameArg {
    None,
    Recordio,
    Zip,
}

impl From<FrameArg> for ImageFrame {
    fn from(arg: FrameArg) -> Self {
        match arg {
            FrameArg::None => ImageFrame::None,
            FrameArg::Recordio => ImageFrame::RecordIo,
            FrameArg::Zip => ImageFrame::Zip,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum LastBatchArg {
    None,
    Drop,
    Pad,
}

impl From<LastBatchArg> for LastBatchHandling {
    fn from(arg: LastBatchArg) -> Self {
        match arg {
            LastBatchArg::None => LastBatchHandling::None,
            LastBatchArg::Drop => LastBatchHandling::Drop,
            LastBatchArg::Pad => LastBatchHandling::Pad,
        }
    }
}

fn parse_dims(s: &str) -> std::result::Result<[u32; 3], String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| format!("`{p}`: {e}")))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    parts
        .try_into()
        .map_err(|_| format!("expected CHANNELS,HEIGHT,WIDTH, got `{s}`"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet)?;

    match cli.command {
        Command::Read(args) => read(args),
        Command::Pack(args) => pack(args),
    }
}

fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else if quiet {
        LevelFilter::WARN
    } else {
        LevelFilter::INFO
    };

    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );

    tracing_log::LogTracer::init().context("Failed to bridge log records")?;
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;
    Ok(())
}

fn build_image_params(args: &ReadArgs) -> Result<ImageParams> {
    let mut params = match &args.config {
        Some(path) => ImageParams::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ImageParams::default(),
    };

    if let Some(frame) = args.frame {
        params.image_frame = frame.into();
    }
    if let Some(edge) = args.resize {
        params.resize = Some(edge);
    }
    if let Some(dims) = args.dims {
        params.image_dimensions = dims;
    }
    if args.to_rgb {
        params.to_rgb = true;
    }

    params.validate().context("Invalid image parameters")?;
    Ok(params)
}

fn read(args: ReadArgs) -> Result<()> {
    let image_params = build_image_params(&args)?;

    let dataset =
        list_files(&args.inputs, &FileListOptions::default()).context("Failed to list inputs")?;
    if dataset.is_empty() {
        anyhow::bail!("No input files found");
    }
    log::info!("Reading {} sources as {}", dataset.len(), image_params.image_frame);

    let mut reader_params = ReaderParams::new(dataset, args.batch_size)
        .skip(args.skip)
        .last_batch(args.last_batch.into())
        .prefetch(args.prefetch);
    if let Some(limit) = args.limit {
        reader_params = reader_params.limit(limit);
    }

    let mut reader =
        ImageReader::new(reader_params, image_params).context("Failed to create image reader")?;

    let start = Instant::now();
    let mut images = 0;
    let mut padding = 0;
    loop {
        match reader.read_example() {
            Ok(example) => {
                let value = example.value();
                log::info!(
                    "Batch {}: shape {:?} strides {:?}",
                    reader.num_examples_read(),
                    value.shape(),
                    value.strides()
                );
                images += value.batch_size() - example.padding;
                padding += example.padding;
            }
            Err(Error::EndOfData) => break,
            Err(e @ Error::BatchSize { .. }) => {
                log::warn!("{e}");
                if let Some(partial) = e.into_partial_example() {
                    images += partial.value().batch_size();
                    log::warn!("Partial batch shape {:?}", partial.value().shape());
                }
                break;
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read batch {}", reader.num_examples_read() + 1)
                });
            }
        }
    }

    log::info!(
        "Done: {} batches, {images} images, {padding} padded slots in {:.2?}",
        reader.num_examples_read(),
        start.elapsed()
    );
    Ok(())
}

fn pack(args: PackArgs) -> Result<()> {
    let sources =
        list_files(&args.images, &FileListOptions::default()).context("Failed to list images")?;
    if sources.is_empty() {
        anyhow::bail!("No images found");
    }

    let file = File::create(&args.output)
        .with_context(|| format!("Failed to create {}", args.output.display()))?;
    let mut writer = RecordWriter::new(BufWriter::new(file), args.output.display().to_string());

    for (id, source) in sources.iter().enumerate() {
        let data = source.read_all()?;
        writer
            .write_image(&ImageRecordHeader::new(0.0, id as u64), &data)
            .with_context(|| format!("Failed to pack {}", source.id()))?;
        log::debug!("Packed {} ({} bytes)", source.id(), data.len());
    }

    let records = writer.records_written();
    writer.finish().context("Failed to finish RecordIO file")?;
    log::info!("Done: {records} records written to {}", args.output.display());
    Ok(())
}
