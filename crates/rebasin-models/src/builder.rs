//! Helpers for declaring permutation tables.
//!
//! A table names every tensor with at least one permuted axis and the
//! group each such axis belongs to. Tensors left out of the table pass
//! through the applier untouched.
//!
//! UNet groups stay internal to their blocks (a residual block's hidden
//! channels, an attention's query/key and value/output pairs): the UNet
//! trunk itself is never permuted, because its skip connections
//! concatenate two differently-grouped streams onto one axis, which a
//! per-axis group assignment cannot express. The VAE has no skip
//! concatenation, so its trunk is chained through explicit `stream`
//! groups; that chaining is what lets the final `norm_out` layers
//! participate in alignment.
//!
//! Group identifiers are `kind:path` strings, e.g.
//! `res:model.diffusion_model.input_blocks.1.0`, which keeps solver logs
//! readable and the tables greppable. Stream groups are named after the
//! conv that produces the basis.

use std::collections::BTreeMap;

use rebasin_core::{GroupId, PermutationSpec};

/// Accumulates per-key axis assignments for one model family.
#[derive(Debug, Default)]
pub struct TableBuilder {
    axes: BTreeMap<String, Vec<Option<GroupId>>>,
}

impl TableBuilder {
    /// Start an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tensor's per-axis group assignment.
    pub fn tensor(&mut self, key: impl Into<String>, axes: Vec<Option<GroupId>>) {
        let key = key.into();
        let previous = self.axes.insert(key.clone(), axes);
        debug_assert!(previous.is_none(), "duplicate table entry: {key}");
    }

    /// Number of registered tensors.
    pub fn len(&self) -> usize {
        self.axes.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.axes.is_empty()
    }

    /// Finish the table.
    pub fn build(self) -> PermutationSpec {
        PermutationSpec::from_axes_to_perm(self.axes)
    }
}

/// Compose a group identifier from a kind and a key path.
pub fn group(kind: &str, path: &str) -> GroupId {
    format!("{kind}:{path}")
}

/// Axes of a conv weight `[out, in, kh, kw]` whose output channels are
/// permuted.
pub fn conv_out(p: &GroupId) -> Vec<Option<GroupId>> {
    vec![Some(p.clone()), None, None, None]
}

/// Axes of a conv weight `[out, in, kh, kw]` whose input channels are
/// permuted.
pub fn conv_in(p: &GroupId) -> Vec<Option<GroupId>> {
    vec![None, Some(p.clone()), None, None]
}

/// Axes of a linear weight `[out, in]` whose output features are permuted.
pub fn linear_out(p: &GroupId) -> Vec<Option<GroupId>> {
    vec![Some(p.clone()), None]
}

/// Axes of a linear weight `[out, in]` whose input features are permuted.
pub fn linear_in(p: &GroupId) -> Vec<Option<GroupId>> {
    vec![None, Some(p.clone())]
}

/// Axes of a linear weight `[out, in]` permuted on both sides.
pub fn linear(p_out: &GroupId, p_in: &GroupId) -> Vec<Option<GroupId>> {
    vec![Some(p_out.clone()), Some(p_in.clone())]
}

/// Axes of a conv weight `[out, in, kh, kw]` permuted on both channel
/// axes.
pub fn conv(p_out: &GroupId, p_in: &GroupId) -> Vec<Option<GroupId>> {
    vec![Some(p_out.clone()), Some(p_in.clone()), None, None]
}

/// Axes of a bias or norm-scale vector `[n]`.
pub fn vector(p: &GroupId) -> Vec<Option<GroupId>> {
    vec![Some(p.clone())]
}

/// The shared timestep-embedding group every UNet residual block reads.
pub(crate) fn time_group() -> GroupId {
    group("temb", "model.diffusion_model")
}

/// Timestep embedding MLP: hidden features and the embedding itself.
pub(crate) fn time_embedding(t: &mut TableBuilder) {
    let hidden = group("temb_hidden", "model.diffusion_model");
    let temb = time_group();
    t.tensor("model.diffusion_model.time_embed.0.weight", linear_out(&hidden));
    t.tensor("model.diffusion_model.time_embed.0.bias", vector(&hidden));
    t.tensor("model.diffusion_model.time_embed.2.weight", linear(&temb, &hidden));
    t.tensor("model.diffusion_model.time_embed.2.bias", vector(&temb));
}

/// SDXL class/size embedding MLP. Its output is added to the timestep
/// embedding, so the final projection joins the `temb` group.
pub(crate) fn label_embedding(t: &mut TableBuilder) {
    let hidden = group("label_hidden", "model.diffusion_model");
    let temb = time_group();
    t.tensor("model.diffusion_model.label_emb.0.0.weight", linear_out(&hidden));
    t.tensor("model.diffusion_model.label_emb.0.0.bias", vector(&hidden));
    t.tensor("model.diffusion_model.label_emb.0.2.weight", linear(&temb, &hidden));
    t.tensor("model.diffusion_model.label_emb.0.2.bias", vector(&temb));
}

/// One UNet residual block's hidden channels: produced by `in_layers.2`,
/// shifted by the timestep projection, normalized by `out_layers.0`, and
/// consumed by `out_layers.3`.
pub(crate) fn unet_res_block(t: &mut TableBuilder, prefix: &str) {
    let p = group("res", prefix);
    let temb = time_group();
    t.tensor(format!("{prefix}.in_layers.2.weight"), conv_out(&p));
    t.tensor(format!("{prefix}.in_layers.2.bias"), vector(&p));
    t.tensor(format!("{prefix}.emb_layers.1.weight"), linear(&p, &temb));
    t.tensor(format!("{prefix}.emb_layers.1.bias"), vector(&p));
    t.tensor(format!("{prefix}.out_layers.0.weight"), vector(&p));
    t.tensor(format!("{prefix}.out_layers.0.bias"), vector(&p));
    t.tensor(format!("{prefix}.out_layers.3.weight"), conv_in(&p));
}

/// Attention projections for every transformer block of one spatial
/// transformer. Queries and keys share a group (dot products survive a
/// shared row permutation); values and the output projection share
/// another. The feed-forward GEGLU is left alone since its paired gate
/// and value halves cannot be described by a single per-axis group.
pub(crate) fn spatial_transformer(t: &mut TableBuilder, prefix: &str, depth: usize) {
    for block in 0..depth {
        for attn in ["attn1", "attn2"] {
            let base = format!("{prefix}.transformer_blocks.{block}.{attn}");
            let qk = group("qk", &base);
            let vo = group("vo", &base);
            t.tensor(format!("{base}.to_q.weight"), linear_out(&qk));
            t.tensor(format!("{base}.to_k.weight"), linear_out(&qk));
            t.tensor(format!("{base}.to_v.weight"), linear_out(&vo));
            t.tensor(format!("{base}.to_out.0.weight"), linear_in(&vo));
        }
    }
}

/// The SD1/SD2 UNet: residual blocks at input positions 1, 2, 4, 5, 7,
/// 8, 10 and 11, spatial transformers at every attended resolution
/// (everything but the innermost input stage), the three middle blocks,
/// and twelve output blocks with transformers from position 3 on.
pub(crate) fn sd_unet(t: &mut TableBuilder) {
    time_embedding(t);
    for i in [1usize, 2, 4, 5, 7, 8, 10, 11] {
        unet_res_block(t, &format!("model.diffusion_model.input_blocks.{i}.0"));
    }
    for i in [1usize, 2, 4, 5, 7, 8] {
        spatial_transformer(t, &format!("model.diffusion_model.input_blocks.{i}.1"), 1);
    }
    unet_res_block(t, "model.diffusion_model.middle_block.0");
    spatial_transformer(t, "model.diffusion_model.middle_block.1", 1);
    unet_res_block(t, "model.diffusion_model.middle_block.2");
    for i in 0..12 {
        unet_res_block(t, &format!("model.diffusion_model.output_blocks.{i}.0"));
        if i >= 3 {
            spatial_transformer(t, &format!("model.diffusion_model.output_blocks.{i}.1"), 1);
        }
    }
}

/// The SDXL UNet: three resolution stages, transformer depth 2 at the
/// middle stage and 10 at the innermost, plus the class embedding MLP.
pub(crate) fn sdxl_unet(t: &mut TableBuilder) {
    time_embedding(t);
    label_embedding(t);
    for i in [1usize, 2, 4, 5, 7, 8] {
        unet_res_block(t, &format!("model.diffusion_model.input_blocks.{i}.0"));
    }
    for (i, depth) in [(4usize, 2usize), (5, 2), (7, 10), (8, 10)] {
        spatial_transformer(t, &format!("model.diffusion_model.input_blocks.{i}.1"), depth);
    }
    unet_res_block(t, "model.diffusion_model.middle_block.0");
    spatial_transformer(t, "model.diffusion_model.middle_block.1", 10);
    unet_res_block(t, "model.diffusion_model.middle_block.2");
    for i in 0..9 {
        unet_res_block(t, &format!("model.diffusion_model.output_blocks.{i}.0"));
    }
    for (i, depth) in [(0usize, 10usize), (1, 10), (2, 10), (3, 2), (4, 2), (5, 2)] {
        spatial_transformer(t, &format!("model.diffusion_model.output_blocks.{i}.1"), depth);
    }
}

/// Stream group produced by the conv at `path`.
pub(crate) fn stream(path: &str) -> GroupId {
    group("stream", path)
}

/// One VAE residual block with an identity shortcut: the stream group on
/// the outer norm and conv channel axes, an internal hidden group between
/// `conv1` and `conv2`.
pub(crate) fn vae_res_block(t: &mut TableBuilder, prefix: &str, s: &GroupId) {
    let h = group("res", prefix);
    t.tensor(format!("{prefix}.norm1.weight"), vector(s));
    t.tensor(format!("{prefix}.norm1.bias"), vector(s));
    t.tensor(format!("{prefix}.conv1.weight"), conv(&h, s));
    t.tensor(format!("{prefix}.conv1.bias"), vector(&h));
    t.tensor(format!("{prefix}.norm2.weight"), vector(&h));
    t.tensor(format!("{prefix}.norm2.bias"), vector(&h));
    t.tensor(format!("{prefix}.conv2.weight"), conv(s, &h));
    t.tensor(format!("{prefix}.conv2.bias"), vector(s));
}

/// A VAE residual block that changes channel count; the `nin_shortcut`
/// 1x1 conv carries the incoming stream into the widened one.
pub(crate) fn vae_res_block_widening(
    t: &mut TableBuilder,
    prefix: &str,
    s_in: &GroupId,
    s_out: &GroupId,
) {
    let h = group("res", prefix);
    t.tensor(format!("{prefix}.norm1.weight"), vector(s_in));
    t.tensor(format!("{prefix}.norm1.bias"), vector(s_in));
    t.tensor(format!("{prefix}.conv1.weight"), conv(&h, s_in));
    t.tensor(format!("{prefix}.conv1.bias"), vector(&h));
    t.tensor(format!("{prefix}.norm2.weight"), vector(&h));
    t.tensor(format!("{prefix}.norm2.bias"), vector(&h));
    t.tensor(format!("{prefix}.conv2.weight"), conv(s_out, &h));
    t.tensor(format!("{prefix}.conv2.bias"), vector(s_out));
    t.tensor(format!("{prefix}.nin_shortcut.weight"), conv(s_out, s_in));
    t.tensor(format!("{prefix}.nin_shortcut.bias"), vector(s_out));
}

/// The VAE mid-block attention, single-head with 1x1 conv projections.
/// Queries and keys share a group, values and the output projection
/// another; the surrounding norm and the residual path stay on the
/// stream.
pub(crate) fn vae_attention(t: &mut TableBuilder, prefix: &str, s: &GroupId) {
    let qk = group("qk", prefix);
    let vo = group("vo", prefix);
    t.tensor(format!("{prefix}.norm.weight"), vector(s));
    t.tensor(format!("{prefix}.norm.bias"), vector(s));
    t.tensor(format!("{prefix}.q.weight"), conv(&qk, s));
    t.tensor(format!("{prefix}.q.bias"), vector(&qk));
    t.tensor(format!("{prefix}.k.weight"), conv(&qk, s));
    t.tensor(format!("{prefix}.k.bias"), vector(&qk));
    t.tensor(format!("{prefix}.v.weight"), conv(&vo, s));
    t.tensor(format!("{prefix}.v.bias"), vector(&vo));
    t.tensor(format!("{prefix}.proj_out.weight"), conv(s, &vo));
    t.tensor(format!("{prefix}.proj_out.bias"), vector(s));
}

/// The VAE encoder: the stream runs from `conv_in` through four
/// two-block stages into the mid blocks and `norm_out`. Stages 1 and 2
/// widen the stream in their first block; every downsample conv starts a
/// fresh stream group.
pub(crate) fn vae_encoder(t: &mut TableBuilder) {
    let root = "first_stage_model.encoder";

    let s0 = stream(&format!("{root}.conv_in"));
    t.tensor(format!("{root}.conv_in.weight"), conv_out(&s0));
    t.tensor(format!("{root}.conv_in.bias"), vector(&s0));
    vae_res_block(t, &format!("{root}.down.0.block.0"), &s0);
    vae_res_block(t, &format!("{root}.down.0.block.1"), &s0);

    let s1 = stream(&format!("{root}.down.0.downsample"));
    t.tensor(format!("{root}.down.0.downsample.conv.weight"), conv(&s1, &s0));
    t.tensor(format!("{root}.down.0.downsample.conv.bias"), vector(&s1));
    let s1w = stream(&format!("{root}.down.1.block.0"));
    vae_res_block_widening(t, &format!("{root}.down.1.block.0"), &s1, &s1w);
    vae_res_block(t, &format!("{root}.down.1.block.1"), &s1w);

    let s2 = stream(&format!("{root}.down.1.downsample"));
    t.tensor(format!("{root}.down.1.downsample.conv.weight"), conv(&s2, &s1w));
    t.tensor(format!("{root}.down.1.downsample.conv.bias"), vector(&s2));
    let s2w = stream(&format!("{root}.down.2.block.0"));
    vae_res_block_widening(t, &format!("{root}.down.2.block.0"), &s2, &s2w);
    vae_res_block(t, &format!("{root}.down.2.block.1"), &s2w);

    let s3 = stream(&format!("{root}.down.2.downsample"));
    t.tensor(format!("{root}.down.2.downsample.conv.weight"), conv(&s3, &s2w));
    t.tensor(format!("{root}.down.2.downsample.conv.bias"), vector(&s3));
    vae_res_block(t, &format!("{root}.down.3.block.0"), &s3);
    vae_res_block(t, &format!("{root}.down.3.block.1"), &s3);
    vae_res_block(t, &format!("{root}.mid.block_1"), &s3);
    vae_attention(t, &format!("{root}.mid.attn_1"), &s3);
    vae_res_block(t, &format!("{root}.mid.block_2"), &s3);

    t.tensor(format!("{root}.norm_out.weight"), vector(&s3));
    t.tensor(format!("{root}.norm_out.bias"), vector(&s3));
    t.tensor(format!("{root}.conv_out.weight"), conv_in(&s3));
}

/// The VAE decoder: the stream runs from `conv_in` through the mid
/// blocks and four three-block stages to `norm_out`. Stages are executed
/// from `up.3` down to `up.0`; `up.1` and `up.0` narrow the stream in
/// their first block, and every upsample conv starts a fresh stream
/// group.
pub(crate) fn vae_decoder(t: &mut TableBuilder) {
    let root = "first_stage_model.decoder";

    let sm = stream(&format!("{root}.conv_in"));
    t.tensor(format!("{root}.conv_in.weight"), conv_out(&sm));
    t.tensor(format!("{root}.conv_in.bias"), vector(&sm));
    vae_res_block(t, &format!("{root}.mid.block_1"), &sm);
    vae_attention(t, &format!("{root}.mid.attn_1"), &sm);
    vae_res_block(t, &format!("{root}.mid.block_2"), &sm);
    for block in 0..3 {
        vae_res_block(t, &format!("{root}.up.3.block.{block}"), &sm);
    }

    let s2 = stream(&format!("{root}.up.3.upsample"));
    t.tensor(format!("{root}.up.3.upsample.conv.weight"), conv(&s2, &sm));
    t.tensor(format!("{root}.up.3.upsample.conv.bias"), vector(&s2));
    for block in 0..3 {
        vae_res_block(t, &format!("{root}.up.2.block.{block}"), &s2);
    }

    let s1 = stream(&format!("{root}.up.2.upsample"));
    t.tensor(format!("{root}.up.2.upsample.conv.weight"), conv(&s1, &s2));
    t.tensor(format!("{root}.up.2.upsample.conv.bias"), vector(&s1));
    let s1w = stream(&format!("{root}.up.1.block.0"));
    vae_res_block_widening(t, &format!("{root}.up.1.block.0"), &s1, &s1w);
    vae_res_block(t, &format!("{root}.up.1.block.1"), &s1w);
    vae_res_block(t, &format!("{root}.up.1.block.2"), &s1w);

    let s0 = stream(&format!("{root}.up.1.upsample"));
    t.tensor(format!("{root}.up.1.upsample.conv.weight"), conv(&s0, &s1w));
    t.tensor(format!("{root}.up.1.upsample.conv.bias"), vector(&s0));
    let s0w = stream(&format!("{root}.up.0.block.0"));
    vae_res_block_widening(t, &format!("{root}.up.0.block.0"), &s0, &s0w);
    vae_res_block(t, &format!("{root}.up.0.block.1"), &s0w);
    vae_res_block(t, &format!("{root}.up.0.block.2"), &s0w);

    t.tensor(format!("{root}.norm_out.weight"), vector(&s0w));
    t.tensor(format!("{root}.norm_out.bias"), vector(&s0w));
    t.tensor(format!("{root}.conv_out.weight"), conv_in(&s0w));
}

/// The kl-f8 autoencoder shared by every family.
pub(crate) fn vae(t: &mut TableBuilder) {
    vae_encoder(t);
    vae_decoder(t);
}

/// CLIP ViT-L text encoder MLP inner features, one group per layer. The
/// activation is elementwise, so these permute exactly.
pub(crate) fn clip_mlp(t: &mut TableBuilder, root: &str, layers: usize) {
    for layer in 0..layers {
        let base = format!("{root}.encoder.layers.{layer}.mlp");
        let p = group("mlp", &base);
        t.tensor(format!("{base}.fc1.weight"), linear_out(&p));
        t.tensor(format!("{base}.fc1.bias"), vector(&p));
        t.tensor(format!("{base}.fc2.weight"), linear_in(&p));
    }
}

/// OpenCLIP text encoder MLP inner features (SD2 naming).
pub(crate) fn open_clip_mlp(t: &mut TableBuilder, root: &str, blocks: usize) {
    for block in 0..blocks {
        let base = format!("{root}.transformer.resblocks.{block}.mlp");
        let p = group("mlp", &base);
        t.tensor(format!("{base}.c_fc.weight"), linear_out(&p));
        t.tensor(format!("{base}.c_fc.bias"), vector(&p));
        t.tensor(format!("{base}.c_proj.weight"), linear_in(&p));
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use ndarray::{ArrayD, IxDyn};
    use rebasin_core::{ParameterSet, PermutationSpec, Tensor};

    use std::collections::BTreeMap;

    /// Build a parameter set shaped by the table itself: permuted axes
    /// take small per-group sizes, free axes a fixed size of 3. Values
    /// increase strictly along the flat index, so every slice's rows are
    /// elementwise ordered and each group's self-match optimum is
    /// uniquely the identity.
    pub(crate) fn synthetic_params(spec: &PermutationSpec) -> ParameterSet {
        let mut sizes: BTreeMap<&str, usize> = BTreeMap::new();
        for (index, group) in spec.group_ids().enumerate() {
            sizes.insert(group.as_str(), 2 + index % 3);
        }

        let mut params = ParameterSet::new();
        for group in spec.group_ids() {
            for (key, _) in spec.axes_in_group(group).unwrap() {
                if params.contains(key) {
                    continue;
                }
                let axes = spec.axes_of(key).unwrap();
                let shape: Vec<usize> = axes
                    .iter()
                    .map(|slot| match slot {
                        Some(g) => sizes[g.as_str()],
                        None => 3,
                    })
                    .collect();
                let count: usize = shape.iter().product();
                let values: Vec<f32> = (0..count).map(|j| 1.0 + j as f32 * 0.5).collect();
                let array = ArrayD::from_shape_vec(IxDyn(&shape), values).unwrap();
                params.insert(key.clone(), Tensor::F32(array));
            }
        }
        params
    }
}
