//! The re-basin merge pipeline.
//!
//! This module provides the high-level API for merging two checkpoints.
//! It coordinates loading, architecture detection, the iterated
//! blend-align loop, the position-ids check, and saving the result.
//!
//! Each round blends a fraction of model B into the working set, aligns
//! the result back into model A's basin, then solves a second alignment
//! toward model B so the fixed output layers can be blended between the
//! two aligned states, weighted by solver confidence. The per-round
//! fractions are chosen so the rounds compose to the configured alpha.

use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use rebasin_core::{
    apply_permutation, weight_matching, KeyPolicy, MatchOptions, ParameterSet, PermutationSpec,
};
use rebasin_models::{detect, Architecture};
use tracing::{debug, info, warn};

use crate::blend::{
    blend_special, check_position_ids, copy_missing, prune, repair_position_ids, weighted_blend,
    PositionIdsFinding,
};
use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::loader::{load_parameter_set, resolve_output_path, save_parameter_set};

/// One blend-align round's outcome.
#[derive(Debug, Clone)]
pub struct IterationReport {
    /// Round index, starting at zero.
    pub index: usize,

    /// Fraction of model B blended in this round.
    pub blend_alpha: f32,

    /// Mean solver improvement while aligning to model A.
    pub score_to_a: f32,

    /// Mean solver improvement while aligning to model B.
    pub score_to_b: f32,

    /// Output-layer blend fraction derived from the two scores.
    pub special_alpha: f32,
}

/// Summary of a completed merge.
#[derive(Debug, Clone)]
pub struct MergeReport {
    /// Detected checkpoint family.
    pub architecture: Architecture,

    /// Number of tensors written to the output.
    pub tensors: usize,

    /// Per-round solver and blend numbers.
    pub rounds: Vec<IterationReport>,

    /// Position-ids finding, when the check tripped.
    pub position_ids: Option<PositionIdsFinding>,

    /// Path the merged checkpoint was written to.
    pub output: PathBuf,
}

/// Main entry point for merging two checkpoint files.
///
/// Loads both models, detects their shared family, runs the blend-align
/// loop, checks (or repairs) the CLIP position-ids tensor, and writes
/// the merged checkpoint.
pub fn run_merge(config: &MergeConfig) -> Result<MergeReport> {
    config.validate()?;

    info!(model_a = %config.model_a.display(), "loading model A");
    let mut model_a = load_parameter_set(&config.model_a)?;
    info!(model_b = %config.model_b.display(), "loading model B");
    let mut model_b = load_parameter_set(&config.model_b)?;

    // Detect before pruning: pruning strips the marker tensors the
    // detector keys on.
    let architecture = detect_pair(&model_a, &model_b)?;
    info!(architecture = %architecture, "detected checkpoint family");

    let spec = architecture.permutation_spec();
    let policy = architecture.key_policy();

    if config.prune {
        let dropped = prune(&mut model_a, &policy) + prune(&mut model_b, &policy);
        info!(dropped, "pruned tensors outside the model namespaces");
    }

    let (mut merged, rounds) = merge_parameter_sets(&model_a, &model_b, &spec, &policy, config)?;

    let position_ids = if config.fix_position_ids {
        let finding = repair_position_ids(&mut merged, &policy);
        if let Some(finding) = &finding {
            info!(key = %finding.key, broken = finding.broken.len(), "replaced drifted position ids");
        }
        finding
    } else {
        let finding = check_position_ids(&merged, &policy);
        if let Some(finding) = &finding {
            warn!(
                key = %finding.key,
                broken = finding.broken.len(),
                "position ids drifted; enable fix_position_ids to repair"
            );
        }
        finding
    };

    let output = resolve_output_path(&config.output, config.format);
    save_parameter_set(&merged, &output, config.format, config.precision, config.overwrite)?;
    info!(output = %output.display(), tensors = merged.len(), "merge complete");

    Ok(MergeReport {
        architecture,
        tensors: merged.len(),
        rounds,
        position_ids,
        output,
    })
}

/// Detect the shared family of the two inputs.
pub fn detect_pair(a: &ParameterSet, b: &ParameterSet) -> Result<Architecture> {
    let arch_a = detect(a);
    let arch_b = detect(b);
    if arch_a != arch_b {
        return Err(MergeError::ArchitectureMismatch {
            model_a: arch_a.name().to_string(),
            model_b: arch_b.name().to_string(),
        });
    }
    Ok(arch_a)
}

/// Run the iterated blend-align loop over two loaded parameter sets.
///
/// The working set starts as a copy of `a` and stays in `a`'s basin
/// throughout; `b` only enters through the per-round blends. Tensors
/// present only in `b` are copied over once, in the first round. Returns
/// the merged set together with one report per round.
pub fn merge_parameter_sets(
    a: &ParameterSet,
    b: &ParameterSet,
    spec: &PermutationSpec,
    policy: &KeyPolicy,
    config: &MergeConfig,
) -> Result<(ParameterSet, Vec<IterationReport>)> {
    config.validate()?;

    let step = config.alpha / config.iterations as f32;
    let mut working = a.clone();
    let mut rounds = Vec::with_capacity(config.iterations);
    let bar = progress_bar(config);

    for round in 0..config.iterations {
        let blend_alpha = iteration_alpha(step, round);
        let blended = weighted_blend(&mut working, b, blend_alpha, policy)?;
        debug!(round, blend_alpha, blended, "blended model B into the working set");

        if round == 0 {
            let copied = copy_missing(&mut working, b, policy);
            if copied > 0 {
                info!(copied, "copied tensors present only in model B");
            }
        }

        let to_a = weight_matching(spec, a, &working, &match_options(config, 2 * round as u64))?;
        working = apply_permutation(spec, policy, &to_a.perm, &working)?;

        let to_b =
            weight_matching(spec, b, &working, &match_options(config, 2 * round as u64 + 1))?;
        let toward_b = apply_permutation(spec, policy, &to_b.perm, &working)?;

        let special = special_alpha(to_a.average_improvement, to_b.average_improvement);
        blend_special(&mut working, &toward_b, special, policy)?;

        debug!(
            round,
            score_to_a = to_a.average_improvement,
            score_to_b = to_b.average_improvement,
            special_alpha = special,
            "round finished"
        );
        rounds.push(IterationReport {
            index: round,
            blend_alpha,
            score_to_a: to_a.average_improvement,
            score_to_b: to_b.average_improvement,
            special_alpha: special,
        });

        if let Some(bar) = &bar {
            bar.set_message(format!("score: {:.4}", to_a.average_improvement));
            bar.inc(1);
        }
    }

    if let Some(bar) = &bar {
        bar.finish_and_clear();
    }
    Ok((working, rounds))
}

/// Per-round blend fraction: a plain `alpha / iterations` step first,
/// then the fraction that carries the accumulated mix the rest of the
/// way, so the rounds compose to the configured alpha overall.
fn iteration_alpha(step: f32, round: usize) -> f32 {
    if round == 0 {
        step
    } else {
        1.0 - (1.0 - step * (round as f32 + 1.0)) / (1.0 - step * round as f32)
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Output-layer blend fraction. The two solver scores pass through a
/// sigmoid and are L1-normalized; the share belonging to the A-side
/// score weights the B-aligned state.
fn special_alpha(score_to_a: f32, score_to_b: f32) -> f32 {
    let a = sigmoid(score_to_a);
    let b = sigmoid(score_to_b);
    a / (a + b)
}

/// Solver options for one alignment solve. Seeded runs derive a distinct
/// stream per solve, so the two alignments of a round never share a
/// visit order.
fn match_options(config: &MergeConfig, solve: u64) -> MatchOptions {
    MatchOptions {
        max_iterations: config.match_iterations,
        precision: config.precision,
        seed: config.seed.map(|seed| seed.wrapping_add(solve)),
        groups: None,
        init: None,
    }
}

fn progress_bar(config: &MergeConfig) -> Option<ProgressBar> {
    if !config.progress {
        return None;
    }
    let bar = ProgressBar::new(config.iterations as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    Some(bar)
}
