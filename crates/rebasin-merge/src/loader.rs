//! Checkpoint I/O.
//!
//! Loading memory-maps a safetensors file and decodes every tensor into an
//! owned [`ParameterSet`]. Byte slices are decoded with explicit
//! little-endian reads, so nothing depends on the mapped tensor data being
//! aligned for its element type. Legacy pickle checkpoints (`.ckpt`,
//! `.pt`, `.bin`) are recognized and rejected with conversion guidance
//! rather than parsed.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use rebasin_core::{ParameterSet, Precision, Tensor};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MergeError, Result};

/// On-disk checkpoint container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointFormat {
    /// The safetensors container. The only format read and written here.
    #[serde(rename = "safetensors")]
    Safetensors,

    /// Pickle-based torch checkpoint. Recognized so it can be rejected
    /// with guidance instead of a parse error.
    #[serde(rename = "ckpt")]
    LegacyCkpt,
}

impl CheckpointFormat {
    /// Conventional file extension for the format.
    pub fn extension(self) -> &'static str {
        match self {
            CheckpointFormat::Safetensors => "safetensors",
            CheckpointFormat::LegacyCkpt => "ckpt",
        }
    }
}

impl fmt::Display for CheckpointFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for CheckpointFormat {
    type Err = MergeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "safetensors" => Ok(CheckpointFormat::Safetensors),
            "ckpt" | "pt" => Ok(CheckpointFormat::LegacyCkpt),
            other => Err(MergeError::InvalidConfig(format!(
                "unknown checkpoint format '{other}', expected safetensors or ckpt"
            ))),
        }
    }
}

/// Identify the container format of `path`.
///
/// Known extensions decide immediately; anything else is sniffed from the
/// first bytes of the file (zip magic for torch archives, the JSON header
/// length prefix for safetensors).
pub fn detect_format(path: &Path) -> Result<CheckpointFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("safetensors") => {
            return Ok(CheckpointFormat::Safetensors);
        }
        Some(ext)
            if ext.eq_ignore_ascii_case("ckpt")
                || ext.eq_ignore_ascii_case("pt")
                || ext.eq_ignore_ascii_case("bin") =>
        {
            return Ok(CheckpointFormat::LegacyCkpt);
        }
        _ => {}
    }

    let mut head = Vec::with_capacity(9);
    File::open(path)?.take(9).read_to_end(&mut head)?;
    if head.starts_with(b"PK\x03\x04") {
        return Ok(CheckpointFormat::LegacyCkpt);
    }
    if head.len() == 9 && head[8] == b'{' {
        let header_len = u64::from_le_bytes([
            head[0], head[1], head[2], head[3], head[4], head[5], head[6], head[7],
        ]);
        if header_len > 0 {
            return Ok(CheckpointFormat::Safetensors);
        }
    }
    Err(MergeError::ModelLoad(format!(
        "unrecognized checkpoint format for {}",
        path.display()
    )))
}

/// Load every tensor of a safetensors checkpoint into memory.
///
/// Floats of any width come back as f32, integers as i64. Legacy pickle
/// checkpoints fail with [`MergeError::LegacyCheckpoint`].
pub fn load_parameter_set(path: impl AsRef<Path>) -> Result<ParameterSet> {
    let path = path.as_ref();
    if detect_format(path)? == CheckpointFormat::LegacyCkpt {
        return Err(MergeError::LegacyCheckpoint(path.to_path_buf()));
    }

    let file = File::open(path)?;
    // SAFETY: the file is opened read-only and the map lives only for the
    // duration of this call; all tensor data is copied out below.
    #[allow(unsafe_code)]
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let tensors = SafeTensors::deserialize(&mmap)?;

    let mut params = ParameterSet::new();
    for (name, view) in tensors.tensors() {
        let tensor = decode_view(&name, &view)?;
        params.insert(name, tensor);
    }

    info!(path = %path.display(), tensors = params.len(), "checkpoint loaded");
    Ok(params)
}

fn decode_view(name: &str, view: &TensorView<'_>) -> Result<Tensor> {
    let shape = view.shape().to_vec();
    let bytes = view.data();
    match view.dtype() {
        Dtype::F32 => {
            let data = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            float_tensor(name, shape, data)
        }
        Dtype::F16 => {
            let data = bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect();
            float_tensor(name, shape, data)
        }
        Dtype::BF16 => {
            let data = bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect();
            float_tensor(name, shape, data)
        }
        Dtype::F64 => {
            let data = bytes
                .chunks_exact(8)
                .map(|c| {
                    f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32
                })
                .collect();
            float_tensor(name, shape, data)
        }
        Dtype::I64 => {
            let data = bytes
                .chunks_exact(8)
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect();
            int_tensor(name, shape, data)
        }
        Dtype::I32 => {
            let data = bytes
                .chunks_exact(4)
                .map(|c| i64::from(i32::from_le_bytes([c[0], c[1], c[2], c[3]])))
                .collect();
            int_tensor(name, shape, data)
        }
        dtype => Err(MergeError::UnsupportedDtype {
            key: name.to_string(),
            dtype,
        }),
    }
}

fn float_tensor(name: &str, shape: Vec<usize>, data: Vec<f32>) -> Result<Tensor> {
    let arr = ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|e| MergeError::ModelLoad(format!("tensor '{name}': {e}")))?;
    Ok(Tensor::F32(arr))
}

fn int_tensor(name: &str, shape: Vec<usize>, data: Vec<i64>) -> Result<Tensor> {
    let arr = ArrayD::from_shape_vec(IxDyn(&shape), data)
        .map_err(|e| MergeError::ModelLoad(format!("tensor '{name}': {e}")))?;
    Ok(Tensor::I64(arr))
}

/// Write `params` to `path` as a safetensors file.
///
/// `precision` selects the stored float width; integer tensors are always
/// written as I64. A torch-compatible `format=pt` metadata entry is
/// stamped so downstream loaders treat the file as a state dict. An
/// existing file is only replaced when `overwrite` is set.
pub fn save_parameter_set(
    params: &ParameterSet,
    path: &Path,
    format: CheckpointFormat,
    precision: Precision,
    overwrite: bool,
) -> Result<()> {
    if format == CheckpointFormat::LegacyCkpt {
        return Err(MergeError::InvalidConfig(
            "writing legacy pickle checkpoints is not supported; use the safetensors format"
                .to_string(),
        ));
    }
    if path.exists() && !overwrite {
        return Err(MergeError::OutputExists(path.to_path_buf()));
    }

    let mut buffers: Vec<(&str, Dtype, Vec<usize>, Vec<u8>)> = Vec::with_capacity(params.len());
    for (key, tensor) in params.iter() {
        let (dtype, bytes) = match tensor {
            Tensor::F32(arr) => match precision {
                Precision::Full => {
                    let data: Vec<f32> = arr.iter().copied().collect();
                    (Dtype::F32, bytemuck::cast_slice(&data).to_vec())
                }
                Precision::Half => {
                    let data: Vec<half::f16> =
                        arr.iter().map(|&v| half::f16::from_f32(v)).collect();
                    (Dtype::F16, bytemuck::cast_slice(&data).to_vec())
                }
            },
            Tensor::I64(arr) => {
                let data: Vec<i64> = arr.iter().copied().collect();
                (Dtype::I64, bytemuck::cast_slice(&data).to_vec())
            }
        };
        buffers.push((key.as_str(), dtype, tensor.shape().to_vec(), bytes));
    }

    let mut views = Vec::with_capacity(buffers.len());
    for (key, dtype, shape, bytes) in &buffers {
        views.push((*key, TensorView::new(*dtype, shape.clone(), bytes)?));
    }

    let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
    safetensors::serialize_to_file(views, &metadata, path)?;

    debug!(path = %path.display(), tensors = params.len(), %precision, "checkpoint saved");
    Ok(())
}

/// Derive the final output file name from a requested stem and format.
///
/// Appends the format extension unless the path already carries it, so
/// `merged` and `merged.safetensors` name the same file.
pub fn resolve_output_path(path: &Path, format: CheckpointFormat) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case(format.extension()) => path.to_path_buf(),
        _ => {
            let mut name = path.as_os_str().to_os_string();
            name.push(".");
            name.push(format.extension());
            PathBuf::from(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_params() -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert(
            "model.diffusion_model.w",
            Tensor::F32(ndarray::arr2(&[[1.0_f32, 2.0, 3.0], [4.0, 5.0, 6.0]]).into_dyn()),
        );
        params.insert(
            "position_ids",
            Tensor::I64(ndarray::arr2(&[[0_i64, 1, 2, 3]]).into_dyn()),
        );
        params
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.safetensors");
        let params = sample_params();

        save_parameter_set(
            &params,
            &path,
            CheckpointFormat::Safetensors,
            Precision::Full,
            false,
        )
        .unwrap();
        let loaded = load_parameter_set(&path).unwrap();

        assert_eq!(loaded, params);
    }

    #[test]
    fn test_half_precision_save_quantizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let values = [1.0_f32, 1.0001, -2.5];
        let mut params = ParameterSet::new();
        params.insert("w", Tensor::F32(ndarray::arr1(&values).into_dyn()));

        save_parameter_set(
            &params,
            &path,
            CheckpointFormat::Safetensors,
            Precision::Half,
            false,
        )
        .unwrap();
        let loaded = load_parameter_set(&path).unwrap();

        let arr = loaded.get("w").unwrap().as_f32().unwrap();
        let expected: Vec<f32> = values
            .iter()
            .map(|&v| half::f16::from_f32(v).to_f32())
            .collect();
        assert_eq!(arr.as_slice().unwrap(), expected.as_slice());
    }

    #[test]
    fn test_metadata_marks_pt_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.safetensors");
        save_parameter_set(
            &sample_params(),
            &path,
            CheckpointFormat::Safetensors,
            Precision::Full,
            false,
        )
        .unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let (_, meta) = SafeTensors::read_metadata(&bytes).unwrap();
        let user = meta.metadata().as_ref().unwrap();
        assert_eq!(user.get("format").map(String::as_str), Some("pt"));
    }

    #[test]
    fn test_legacy_ckpt_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.ckpt");
        std::fs::write(&path, b"PK\x03\x04not really a zip").unwrap();

        let err = load_parameter_set(&path).unwrap_err();
        assert!(matches!(err, MergeError::LegacyCheckpoint(_)));
    }

    #[test]
    fn test_zip_magic_sniffed_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive");
        std::fs::write(&path, b"PK\x03\x04payload").unwrap();

        assert_eq!(detect_format(&path).unwrap(), CheckpointFormat::LegacyCkpt);
    }

    #[test]
    fn test_safetensors_sniffed_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tensors.safetensors");
        save_parameter_set(
            &sample_params(),
            &path,
            CheckpointFormat::Safetensors,
            Precision::Full,
            false,
        )
        .unwrap();

        let blob = dir.path().join("blob");
        std::fs::copy(&path, &blob).unwrap();
        let loaded = load_parameter_set(&blob).unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn test_unrecognized_bytes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mystery");
        std::fs::write(&path, b"hello").unwrap();

        let err = detect_format(&path).unwrap_err();
        assert!(matches!(err, MergeError::ModelLoad(_)));
    }

    #[test]
    fn test_save_rejects_legacy_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ckpt");
        let err = save_parameter_set(
            &sample_params(),
            &path,
            CheckpointFormat::LegacyCkpt,
            Precision::Full,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::InvalidConfig(_)));
    }

    #[test]
    fn test_overwrite_protection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");
        let params = sample_params();

        save_parameter_set(
            &params,
            &path,
            CheckpointFormat::Safetensors,
            Precision::Full,
            false,
        )
        .unwrap();

        let err = save_parameter_set(
            &params,
            &path,
            CheckpointFormat::Safetensors,
            Precision::Full,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::OutputExists(_)));

        save_parameter_set(
            &params,
            &path,
            CheckpointFormat::Safetensors,
            Precision::Full,
            true,
        )
        .unwrap();
    }

    #[test]
    fn test_unaligned_tensor_data_decodes() {
        // A 3-element f16 tensor ahead of an f32 tensor leaves the f32
        // data 2 bytes off a 4-byte boundary in the serialized buffer.
        let a_bytes: Vec<u8> = [1.0_f32, 2.0, 3.0]
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect();
        let b_bytes: Vec<u8> = [5.0_f32, 6.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let views = vec![
            ("a", TensorView::new(Dtype::F16, vec![3], &a_bytes).unwrap()),
            ("b", TensorView::new(Dtype::F32, vec![2], &b_bytes).unwrap()),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.safetensors");
        safetensors::serialize_to_file(views, &None, &path).unwrap();

        let loaded = load_parameter_set(&path).unwrap();
        let a = loaded.get("a").unwrap().as_f32().unwrap();
        let b = loaded.get("b").unwrap().as_f32().unwrap();
        assert_eq!(a.as_slice().unwrap(), &[1.0, 2.0, 3.0]);
        assert_eq!(b.as_slice().unwrap(), &[5.0, 6.0]);
    }

    #[test]
    fn test_unsupported_dtype_rejected() {
        let raw = [0u8, 1, 2, 3];
        let views = vec![("mask", TensorView::new(Dtype::U8, vec![4], &raw).unwrap())];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("u8.safetensors");
        safetensors::serialize_to_file(views, &None, &path).unwrap();

        let err = load_parameter_set(&path).unwrap_err();
        match err {
            MergeError::UnsupportedDtype { key, dtype } => {
                assert_eq!(key, "mask");
                assert_eq!(dtype, Dtype::U8);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_output_path() {
        let st = CheckpointFormat::Safetensors;
        assert_eq!(
            resolve_output_path(Path::new("merged"), st),
            PathBuf::from("merged.safetensors")
        );
        assert_eq!(
            resolve_output_path(Path::new("merged.safetensors"), st),
            PathBuf::from("merged.safetensors")
        );
        assert_eq!(
            resolve_output_path(Path::new("v2.final"), st),
            PathBuf::from("v2.final.safetensors")
        );
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(
            "safetensors".parse::<CheckpointFormat>().unwrap(),
            CheckpointFormat::Safetensors
        );
        assert_eq!(
            "CKPT".parse::<CheckpointFormat>().unwrap(),
            CheckpointFormat::LegacyCkpt
        );
        assert!("onnx".parse::<CheckpointFormat>().is_err());
    }
}
