//! Rebasin CLI - permutation-aligned Stable Diffusion checkpoint merging.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use rebasin_core::Precision;
use rebasin_merge::{load_parameter_set, resolve_output_path, run_merge, MergeConfig};

#[derive(Parser)]
#[command(name = "rebasin")]
#[command(author, version, about = "Permutation-aligned Stable Diffusion checkpoint merging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge two checkpoints of the same family
    Merge {
        /// Path to merge configuration file (YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// First input checkpoint; the merge stays in this model's basin
        #[arg(long)]
        model_a: Option<PathBuf>,

        /// Second input checkpoint
        #[arg(long)]
        model_b: Option<PathBuf>,

        /// Output file or stem; the format extension is appended when missing
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Final fraction of model B in the blend
        #[arg(long)]
        alpha: Option<f32>,

        /// Number of blend-align rounds
        #[arg(long)]
        iterations: Option<usize>,

        /// Solver pass budget per alignment
        #[arg(long)]
        match_iterations: Option<usize>,

        /// Store merged tensors as 16-bit floats
        #[arg(long)]
        fp16: bool,

        /// Output container format
        #[arg(long)]
        format: Option<String>,

        /// Drop tensors outside the UNet/VAE/text-encoder namespaces first
        #[arg(long)]
        prune: bool,

        /// Replace a drifted CLIP position-ids tensor with the canonical one
        #[arg(long)]
        fix_position_ids: bool,

        /// Seed for the solver's visit order; seeded runs are reproducible
        #[arg(long)]
        seed: Option<u64>,

        /// Do not draw the per-round progress bar
        #[arg(long)]
        no_progress: bool,

        /// Overwrite the output file without asking
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Identify a checkpoint's family
    Detect {
        /// Checkpoint to inspect
        checkpoint: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Merge {
            config,
            model_a,
            model_b,
            output,
            alpha,
            iterations,
            match_iterations,
            fp16,
            format,
            prune,
            fix_position_ids,
            seed,
            no_progress,
            yes,
        } => run_merge_command(
            config,
            model_a,
            model_b,
            output,
            alpha,
            iterations,
            match_iterations,
            fp16,
            format,
            prune,
            fix_position_ids,
            seed,
            no_progress,
            yes,
        ),
        Commands::Detect { checkpoint } => run_detect(&checkpoint),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_merge_command(
    config_file: Option<PathBuf>,
    model_a: Option<PathBuf>,
    model_b: Option<PathBuf>,
    output: Option<PathBuf>,
    alpha: Option<f32>,
    iterations: Option<usize>,
    match_iterations: Option<usize>,
    fp16: bool,
    format: Option<String>,
    prune: bool,
    fix_position_ids: bool,
    seed: Option<u64>,
    no_progress: bool,
    yes: bool,
) -> anyhow::Result<()> {
    let mut config = match &config_file {
        Some(path) => MergeConfig::from_yaml_file(path)?,
        None => match (&model_a, &model_b) {
            (Some(a), Some(b)) => {
                let output = output.clone().unwrap_or_else(|| PathBuf::from("merged"));
                MergeConfig::new(a, b, output)
            }
            _ => anyhow::bail!("--model-a and --model-b are required without --config"),
        },
    };

    // Explicit flags override the config file.
    if let Some(model_a) = model_a {
        config.model_a = model_a;
    }
    if let Some(model_b) = model_b {
        config.model_b = model_b;
    }
    if let Some(output) = output {
        config.output = output;
    }
    if let Some(alpha) = alpha {
        config.alpha = alpha;
    }
    if let Some(iterations) = iterations {
        config.iterations = iterations;
    }
    if let Some(match_iterations) = match_iterations {
        config.match_iterations = match_iterations;
    }
    if let Some(format) = format {
        config.format = format.parse()?;
    }
    if fp16 {
        config.precision = Precision::Half;
    }
    if prune {
        config.prune = true;
    }
    if fix_position_ids {
        config.fix_position_ids = true;
    }
    if let Some(seed) = seed {
        config.seed = Some(seed);
    }
    if yes {
        config.overwrite = true;
    }
    config.progress = !no_progress;

    let resolved = resolve_output_path(&config.output, config.format);
    if resolved.exists() && !config.overwrite {
        if confirm_overwrite(&resolved)? {
            config.overwrite = true;
        } else {
            anyhow::bail!("not overwriting {}", resolved.display());
        }
    }

    let report = run_merge(&config)?;

    println!(
        "Merged {} + {} ({}, {} precision) -> {} ({} tensors)",
        config.model_a.display(),
        config.model_b.display(),
        report.architecture,
        config.precision,
        report.output.display(),
        report.tensors,
    );
    if let Some(finding) = &report.position_ids {
        if finding.repaired {
            println!(
                "Repaired position ids ({} drifted entries)",
                finding.broken.len()
            );
        } else {
            println!(
                "Warning: position ids drifted at {} entries; re-run with --fix-position-ids",
                finding.broken.len()
            );
        }
    }
    Ok(())
}

fn run_detect(checkpoint: &Path) -> anyhow::Result<()> {
    let params = load_parameter_set(checkpoint)?;
    let architecture = rebasin_models::detect(&params);
    println!(
        "{}: {} ({} tensors)",
        checkpoint.display(),
        architecture,
        params.len()
    );
    Ok(())
}

fn confirm_overwrite(path: &Path) -> anyhow::Result<bool> {
    loop {
        print!("Output file {} exists. Overwrite? (y/n): ", path.display());
        io::stdout().flush()?;
        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            return Ok(false);
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" => return Ok(true),
            "n" | "no" => return Ok(false),
            _ => {}
        }
    }
}
