//! Background Removal CLI Tool
//!
//! Command-line interface for removing or replacing image backgrounds through
//! the memory-bounded segmentation service.

use super::config::CliConfigBuilder;
use crate::{
    processor::SegmentationService,
    tracing_config::{init_cli_tracing, spans},
    types::{Operation, OutputFormat},
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "bmp", "tiff", "tif"];

/// Background removal and replacement CLI tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "pixport-bgremove")]
#[allow(clippy::struct_excessive_bools)]
pub struct Cli {
    /// Input image files or directories (use "-" for stdin)
    #[arg(value_name = "INPUT", required_unless_present = "status")]
    pub input: Vec<String>,

    /// Output file (single input) or directory (batch processing). Use "-" for stdout.
    #[arg(short, long, value_name = "OUTPUT")]
    pub output: Option<String>,

    /// Replace the background with a colour (#RRGGBB, r,g,b or a preset name)
    #[arg(long, value_name = "COLOR", conflicts_with = "gradient")]
    pub recolor: Option<String>,

    /// Replace the background with a vertical gradient
    #[arg(long, num_args = 2, value_names = ["TOP", "BOTTOM"])]
    pub gradient: Option<Vec<String>>,

    /// Replace the background with a photo, resized to each input
    #[arg(long, value_name = "IMAGE", conflicts_with_all = ["recolor", "gradient"])]
    pub background_image: Option<PathBuf>,

    /// Encoding for opaque results; transparent results are always PNG
    #[arg(short, long, value_enum)]
    pub format: Option<CliOutputFormat>,

    /// JPEG quality (1-100)
    #[arg(long)]
    pub jpeg_quality: Option<u8>,

    /// Deployment profile (standard, constrained, minimal) [default: from environment]
    #[arg(long)]
    pub profile: Option<String>,

    /// Comma-separated permitted backends, e.g. "tiny,cv,edge"
    #[arg(long)]
    pub backends: Option<String>,

    /// Directory holding the ONNX model files
    #[arg(long, value_name = "PATH")]
    pub model_dir: Option<PathBuf>,

    /// Neural runtime (onnx, tract)
    #[arg(long)]
    pub runtime: Option<String>,

    /// Threads inside one operator (0 = auto-detect)
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Load the preferred neural model before processing
    #[arg(long)]
    pub warm: bool,

    /// Print the service status as JSON after processing
    #[arg(long)]
    pub status: bool,

    /// Enable verbose logging (-v: DEBUG, -vv: TRACE)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Process directory recursively
    #[arg(short, long)]
    pub recursive: bool,

    /// Pattern for batch processing (e.g., "*.jpg")
    #[arg(long)]
    pub pattern: Option<String>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum CliOutputFormat {
    Png,
    Jpeg,
}

pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_cli_tracing(cli.verbose).context("Failed to initialize tracing")?;

    let profile = CliConfigBuilder::profile_from_cli(&cli)?;
    let operation = CliConfigBuilder::operation_from_cli(&cli)?;

    info!(
        "Profile: {} ({}MB budget), operation: {}",
        profile.kind,
        profile.memory_budget_mb,
        operation.name()
    );

    let service = Arc::new(
        SegmentationService::new(profile).context("Failed to create segmentation service")?,
    );

    if cli.warm {
        if let Some(handle) = service.start_warmer() {
            let status = handle.await.context("Warm-up task failed")?;
            info!("Warm-up finished: {:?}", status);
        }
    }

    if !cli.input.is_empty() {
        let start_time = Instant::now();
        let processed_count = process_inputs(&cli, &service, &operation).await?;
        info!(
            "Processed {} image(s) in {:.2}s",
            processed_count,
            start_time.elapsed().as_secs_f64()
        );
    }

    if cli.status {
        let status = serde_json::to_string_pretty(&service.status())
            .context("Failed to serialize status")?;
        println!("{status}");
    }

    Ok(())
}

async fn process_inputs(
    cli: &Cli,
    service: &Arc<SegmentationService>,
    operation: &Operation,
) -> Result<usize> {
    // Handle stdin specially (single input)
    if cli.input.len() == 1 && cli.input.first().is_some_and(|s| s == "-") {
        return process_stdin(cli.output.as_deref(), service, operation).await;
    }

    let mut all_files = Vec::new();

    for input in &cli.input {
        let path = PathBuf::from(input);

        if path.is_file() {
            if is_image_file(&path) {
                all_files.push(path);
            } else {
                warn!("Skipping unsupported file: {}", path.display());
            }
        } else if path.is_dir() {
            all_files.extend(find_image_files(&path, cli.recursive, cli.pattern.as_deref())?);
        } else {
            anyhow::bail!(
                "Input path does not exist or is not accessible: {}",
                path.display()
            );
        }
    }

    if all_files.is_empty() {
        warn!("No supported image files found in the provided inputs");
        return Ok(0);
    }

    // Sort files alphanumerically for consistent processing order
    all_files.sort();
    let batch_span = spans::batch_processing(all_files.len(), &service.profile().kind.to_string());

    process_batch(cli, service, &all_files, operation)
        .instrument(batch_span)
        .await
}

async fn process_batch(
    cli: &Cli,
    service: &Arc<SegmentationService>,
    all_files: &[PathBuf],
    operation: &Operation,
) -> Result<usize> {
    let file_count = all_files.len();
    info!("Found {} image file(s) to process", file_count);

    let output_dir = prepare_output_dir(cli.output.as_deref(), file_count)?;

    let progress = if file_count > 1 {
        let pb = ProgressBar::new(file_count as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
                )
                .context("Invalid progress bar template")?
                .progress_chars("#>-"),
        );
        Some(pb)
    } else {
        None
    };

    let mut processed_count = 0;
    let mut failed_count = 0;

    for input_file in all_files {
        if let Some(pb) = &progress {
            pb.set_message(format!("Processing {}", input_file.display()));
        }

        let explicit_output = if file_count == 1 {
            cli.output.as_deref()
        } else {
            None
        };

        match process_single_file(
            service,
            input_file,
            explicit_output,
            output_dir.as_deref(),
            operation,
        )
        .await
        {
            Ok(()) => processed_count += 1,
            Err(e) => {
                failed_count += 1;
                error!("Failed to process {}: {:#}", input_file.display(), e);
            },
        }

        if let Some(pb) = &progress {
            pb.inc(1);
        }
    }

    if let Some(pb) = progress {
        pb.finish_with_message(format!(
            "Completed: {processed_count} successful, {failed_count} failed"
        ));
    }

    if processed_count == 0 {
        anyhow::bail!("All {} input(s) failed", file_count);
    }

    Ok(processed_count)
}

async fn process_stdin(
    output: Option<&str>,
    service: &Arc<SegmentationService>,
    operation: &Operation,
) -> Result<usize> {
    let data = tokio::task::spawn_blocking(read_stdin)
        .await
        .context("Failed to read stdin")??;

    let result = Arc::clone(service)
        .process_async(data, operation.clone())
        .await
        .context("Failed to process image from stdin")?;

    match output {
        None | Some("-") => write_stdout(&result.bytes)?,
        Some(path) => result
            .save(path)
            .with_context(|| format!("Failed to write {path}"))?,
    }

    Ok(1)
}

async fn process_single_file(
    service: &Arc<SegmentationService>,
    input_path: &Path,
    explicit_output: Option<&str>,
    output_dir: Option<&Path>,
    operation: &Operation,
) -> Result<()> {
    let span = spans::file_processing(input_path, operation.name());
    write_result(service, input_path, explicit_output, output_dir, operation)
        .instrument(span)
        .await
}

async fn write_result(
    service: &Arc<SegmentationService>,
    input_path: &Path,
    explicit_output: Option<&str>,
    output_dir: Option<&Path>,
    operation: &Operation,
) -> Result<()> {
    let bytes = tokio::fs::read(input_path)
        .await
        .with_context(|| format!("Failed to read {}", input_path.display()))?;

    let result = Arc::clone(service)
        .process_async(bytes, operation.clone())
        .await
        .with_context(|| format!("Failed to process {}", input_path.display()))?;

    if explicit_output == Some("-") {
        return write_stdout(&result.bytes);
    }

    let output_path = match (explicit_output, output_dir) {
        (Some(path), _) => PathBuf::from(path),
        (None, Some(dir)) => generate_output_path(input_path, Some(dir), result.format),
        (None, None) => generate_output_path(input_path, None, result.format),
    };

    tokio::fs::write(&output_path, &result.bytes)
        .await
        .with_context(|| format!("Failed to write {}", output_path.display()))?;

    info!(
        "{} -> {} ({}x{}, {}, {:.0}ms)",
        input_path.display(),
        output_path.display(),
        result.width,
        result.height,
        result.backend,
        result.elapsed.as_secs_f64() * 1000.0
    );
    Ok(())
}

/// Create the batch output directory if needed
fn prepare_output_dir(output: Option<&str>, file_count: usize) -> Result<Option<PathBuf>> {
    if file_count <= 1 {
        return Ok(None);
    }
    let Some(output) = output else {
        return Ok(None);
    };
    if output == "-" {
        anyhow::bail!("Cannot use stdout (-) as output when processing multiple files");
    }

    let output_path = PathBuf::from(output);
    if output_path.is_file() {
        anyhow::bail!(
            "Output path exists and is a file, not a directory: {}",
            output_path.display()
        );
    }
    std::fs::create_dir_all(&output_path).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            output_path.display()
        )
    })?;
    Ok(Some(output_path))
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    io::stdin()
        .read_to_end(&mut buffer)
        .context("Failed to read image data from stdin")?;

    if buffer.is_empty() {
        anyhow::bail!("No data received from stdin");
    }

    Ok(buffer)
}

fn write_stdout(data: &[u8]) -> Result<()> {
    io::stdout()
        .write_all(data)
        .context("Failed to write image data to stdout")?;
    io::stdout().flush().context("Failed to flush stdout")?;
    Ok(())
}

fn find_image_files(dir: &Path, recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    if recursive {
        for entry in walkdir::WalkDir::new(dir) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let path = entry.path();
                if is_image_file(path) && matches_pattern(path, pattern) {
                    files.push(path.to_path_buf());
                }
            }
        }
    } else {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let path = entry.path();
                if is_image_file(&path) && matches_pattern(&path, pattern) {
                    files.push(path);
                }
            }
        }
    }

    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    match pattern {
        Some(pat) => path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| glob::Pattern::new(pat).is_ok_and(|p| p.matches(name))),
        None => true,
    }
}

/// `<stem>_bg_removed.<ext>` next to the input or inside `output_dir`
fn generate_output_path(
    input_path: &Path,
    output_dir: Option<&Path>,
    format: OutputFormat,
) -> PathBuf {
    let stem = input_path.file_stem().unwrap_or_default();
    let dir = output_dir.unwrap_or_else(|| input_path.parent().unwrap_or(Path::new(".")));

    dir.join(format!(
        "{}_bg_removed.{}",
        stem.to_string_lossy(),
        format.extension()
    ))
}
