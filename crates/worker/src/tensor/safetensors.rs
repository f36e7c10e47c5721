//! SafeTensor format support with memory-mapped files
//!
//! The file starts with a little-endian `u64` header length followed by a JSON
//! object mapping tensor names to `{dtype, shape, data_offsets}`. An optional
//! `__metadata__` entry holds free-form strings and is ignored.

use crate::tensor::{Shape, Tensor};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use skinscan_common::{Result, ServiceError};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const METADATA_KEY: &str = "__metadata__";

/// Data type for SafeTensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TensorDType {
    F32,
    F16,
    BF16,
}

impl TensorDType {
    /// Get the size in bytes for this dtype
    pub fn size(&self) -> usize {
        match self {
            TensorDType::F32 => 4,
            TensorDType::F16 | TensorDType::BF16 => 2,
        }
    }

    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "F32" => Some(TensorDType::F32),
            "F16" => Some(TensorDType::F16),
            "BF16" => Some(TensorDType::BF16),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            TensorDType::F32 => "F32",
            TensorDType::F16 => "F16",
            TensorDType::BF16 => "BF16",
        }
    }
}

/// Information about a single tensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TensorInfo {
    pub dtype: String,
    pub shape: Vec<usize>,

    /// Data offsets (start, end) in bytes, relative to the end of the header
    pub data_offsets: [usize; 2],
}

/// Memory-mapped SafeTensor buffer
pub struct SafeTensorBuffer {
    mmap: Mmap,
    tensors: HashMap<String, TensorInfo>,
    header_len: usize,
}

impl SafeTensorBuffer {
    /// Open a SafeTensor file with memory mapping
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = File::open(path).map_err(|e| {
            ServiceError::tensor(format!("Failed to open file {}: {}", path.display(), e))
        })?;

        // SAFETY: the mapping is read-only and the file is not modified while loaded
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| {
                ServiceError::tensor(format!("Failed to mmap file {}: {}", path.display(), e))
            })?
        };

        if mmap.len() < 8 {
            return Err(ServiceError::tensor("File too small to contain header"));
        }

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&mmap[..8]);
        let header_len = u64::from_le_bytes(len_bytes) as usize;

        if mmap.len() - 8 < header_len {
            return Err(ServiceError::tensor(
                "File truncated: header length exceeds file size",
            ));
        }

        let header_json = std::str::from_utf8(&mmap[8..8 + header_len])
            .map_err(|e| ServiceError::tensor(format!("Invalid UTF-8 in header: {}", e)))?;

        let entries: HashMap<String, serde_json::Value> = serde_json::from_str(header_json)
            .map_err(|e| ServiceError::tensor(format!("Failed to parse header JSON: {}", e)))?;

        let mut tensors = HashMap::with_capacity(entries.len());
        for (name, value) in entries {
            if name == METADATA_KEY {
                continue;
            }
            let info: TensorInfo = serde_json::from_value(value).map_err(|e| {
                ServiceError::tensor(format!("Invalid entry for tensor '{}': {}", name, e))
            })?;
            tensors.insert(name, info);
        }

        Ok(Self {
            mmap,
            tensors,
            header_len,
        })
    }

    /// Get tensor names
    pub fn tensor_names(&self) -> impl Iterator<Item = &String> {
        self.tensors.keys()
    }

    /// Get a zero-copy view of a tensor
    pub fn get_tensor(&self, name: &str) -> Result<SafeTensorView<'_>> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| ServiceError::tensor(format!("Tensor '{}' not found", name)))?;

        let dtype = TensorDType::parse(&info.dtype).ok_or_else(|| {
            ServiceError::tensor(format!(
                "Tensor '{}' has unsupported dtype {}",
                name, info.dtype
            ))
        })?;

        let invalid = || {
            ServiceError::tensor(format!(
                "Tensor '{}' has invalid data offsets {:?} for shape {:?}",
                name, info.data_offsets, info.shape
            ))
        };

        // Offsets and shape come from the file, so none of this may overflow
        let [start, end] = info.data_offsets;
        let base = 8 + self.header_len;
        let data_start = base.checked_add(start).ok_or_else(invalid)?;
        let data_end = base.checked_add(end).ok_or_else(invalid)?;
        let byte_len = info
            .shape
            .iter()
            .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(invalid)?;

        if start > end || data_end > self.mmap.len() || end - start != byte_len {
            return Err(invalid());
        }

        Ok(SafeTensorView {
            data: &self.mmap[data_start..data_end],
            shape: info.shape.clone(),
            dtype,
        })
    }

    /// Write `f32` tensors in SafeTensor format
    pub fn save_f32<P: AsRef<Path>>(path: P, tensors: &[(&str, Shape, &[f32])]) -> Result<()> {
        let mut header = BTreeMap::new();
        let mut offset = 0;
        for (name, shape, data) in tensors {
            let bytes = data.len() * TensorDType::F32.size();
            header.insert(
                name.to_string(),
                TensorInfo {
                    dtype: TensorDType::F32.as_str().to_string(),
                    shape: shape.clone(),
                    data_offsets: [offset, offset + bytes],
                },
            );
            offset += bytes;
        }

        let header_json = serde_json::to_string(&header)?;
        let mut file = File::create(path.as_ref())?;
        file.write_all(&(header_json.len() as u64).to_le_bytes())?;
        file.write_all(header_json.as_bytes())?;
        for (_, _, data) in tensors {
            for value in data.iter() {
                file.write_all(&value.to_le_bytes())?;
            }
        }
        file.flush()?;

        Ok(())
    }
}

/// Zero-copy view into a SafeTensor
pub struct SafeTensorView<'a> {
    data: &'a [u8],
    shape: Vec<usize>,
    dtype: TensorDType,
}

impl<'a> SafeTensorView<'a> {
    /// Get the tensor shape
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the tensor dtype
    pub fn dtype(&self) -> TensorDType {
        self.dtype
    }

    /// Get the number of elements
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// Check if the tensor is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode the data into an owned `f32` tensor
    ///
    /// Mapped data carries no alignment guarantee, so values are decoded
    /// byte-wise instead of reinterpreting the slice.
    pub fn to_f32(&self) -> Result<Tensor<f32>> {
        let data: Vec<f32> = match self.dtype {
            TensorDType::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            TensorDType::F16 => self
                .data
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            TensorDType::BF16 => self
                .data
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
        };

        Tensor::new(data, self.shape.clone())
    }
}
