//! Conversion of CLI arguments into a profile and an operation

use crate::cli::main_impl::{Cli, CliOutputFormat};
use crate::{
    color::RgbColor,
    config::{parse_backend_list, DeploymentProfile, DeploymentProfileBuilder, ProfileKind},
    runtime::RuntimeKind,
    types::{Operation, OutputFormat},
};
use anyhow::{Context, Result};

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Profile from the environment (or `--profile`) with CLI overrides applied
    pub(crate) fn profile_from_cli(cli: &Cli) -> Result<DeploymentProfile> {
        let base = match &cli.profile {
            Some(name) => {
                let kind: ProfileKind = name.parse().context("Invalid --profile")?;
                DeploymentProfile::preset(kind)
            },
            None => DeploymentProfile::from_env().context("Invalid profile environment")?,
        };

        let mut builder = DeploymentProfileBuilder::from_profile(base)
            // The CLI decides itself when to warm, see `--warm`
            .warm_on_start(false);

        if let Some(list) = &cli.backends {
            builder = builder.backends(parse_backend_list(list).context("Invalid --backends")?);
        }
        if let Some(dir) = &cli.model_dir {
            builder = builder.model_dir(dir.clone());
        }
        if let Some(runtime) = &cli.runtime {
            let runtime: RuntimeKind = runtime.parse().context("Invalid --runtime")?;
            builder = builder.runtime(runtime);
        }
        if let Some(threads) = cli.threads {
            builder = builder.intra_threads(threads);
        }
        if let Some(format) = cli.format {
            builder = builder.opaque_format(match format {
                CliOutputFormat::Png => OutputFormat::Png,
                CliOutputFormat::Jpeg => OutputFormat::Jpeg,
            });
        }
        if let Some(quality) = cli.jpeg_quality {
            builder = builder.jpeg_quality(quality);
        }

        builder.build().context("Invalid deployment profile")
    }

    /// `--recolor`, `--gradient` and `--background-image` select a replacement,
    /// otherwise the background is removed
    pub(crate) fn operation_from_cli(cli: &Cli) -> Result<Operation> {
        if let Some(color) = &cli.recolor {
            let color: RgbColor = color
                .parse()
                .with_context(|| format!("Invalid --recolor value '{color}'"))?;
            return Ok(Operation::RecolorBackground { color });
        }

        if let Some(path) = &cli.background_image {
            let background = image::open(path)
                .with_context(|| format!("Failed to open background image {}", path.display()))?;
            return Ok(Operation::image_background(&background));
        }

        if let Some(colors) = &cli.gradient {
            let [top, bottom] = colors.as_slice() else {
                anyhow::bail!("--gradient takes exactly two colours");
            };
            let top: RgbColor = top
                .parse()
                .with_context(|| format!("Invalid gradient top colour '{top}'"))?;
            let bottom: RgbColor = bottom
                .parse()
                .with_context(|| format!("Invalid gradient bottom colour '{bottom}'"))?;
            return Ok(Operation::GradientBackground { top, bottom });
        }

        Ok(Operation::RemoveBackground)
    }
}
