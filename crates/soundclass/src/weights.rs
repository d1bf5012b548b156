//! Named `f32` tensors for network construction, from memory or a safetensors file.

use std::collections::HashMap;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use safetensors::tensor::{Dtype, SafeTensorError, TensorView};
use safetensors::SafeTensors;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct TensorF32 {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorF32 {
    #[must_use]
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        debug_assert_eq!(shape.iter().product::<usize>(), data.len());
        Self { shape, data }
    }
}

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error("missing tensor: {0}")]
    Missing(String),
    #[error("unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("tensor {name}: {bytes} bytes is not a whole number of {elem_size}-byte elements")]
    InvalidByteLen {
        name: String,
        bytes: usize,
        elem_size: usize,
    },
}

/// Anything that can hand out named `f32` tensors.
pub trait TensorSource {
    /// Sorted tensor names.
    fn names(&self) -> Result<Vec<String>, WeightError>;
    fn tensor_f32(&self, name: &str) -> Result<TensorF32, WeightError>;
}

impl TensorSource for HashMap<String, TensorF32> {
    fn names(&self) -> Result<Vec<String>, WeightError> {
        let mut names: Vec<String> = self.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn tensor_f32(&self, name: &str) -> Result<TensorF32, WeightError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| WeightError::Missing(name.to_string()))
    }
}

/// Memory-mapped safetensors checkpoint. Tensors are converted to `f32` on request.
#[derive(Debug)]
pub struct WeightStore {
    mmap: Mmap,
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is read-only and the store never hands out mutable views.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        SafeTensors::deserialize(&mmap)?;
        Ok(Self { mmap })
    }

    fn parsed(&self) -> Result<SafeTensors<'_>, WeightError> {
        Ok(SafeTensors::deserialize(&self.mmap)?)
    }
}

impl TensorSource for WeightStore {
    fn names(&self) -> Result<Vec<String>, WeightError> {
        let mut names: Vec<String> = self.parsed()?.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn tensor_f32(&self, name: &str) -> Result<TensorF32, WeightError> {
        let view = match self.parsed()?.tensor(name) {
            Ok(view) => view,
            Err(SafeTensorError::TensorNotFound(_)) => {
                return Err(WeightError::Missing(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(TensorF32 {
            shape: view.shape().to_vec(),
            data: decode_f32(name, &view)?,
        })
    }
}

fn decode_f32(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>, WeightError> {
    let raw = view.data();
    let elem_size = match view.dtype() {
        Dtype::F32 => 4,
        Dtype::BF16 => 2,
        dtype => {
            return Err(WeightError::UnsupportedDtype {
                name: name.to_string(),
                dtype,
            })
        }
    };
    if raw.len() % elem_size != 0 {
        return Err(WeightError::InvalidByteLen {
            name: name.to_string(),
            bytes: raw.len(),
            elem_size,
        });
    }
    let data = if elem_size == 4 {
        raw.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    } else {
        // bf16 is the upper half of an f32.
        raw.chunks_exact(2)
            .map(|b| f32::from_bits(u32::from(u16::from_le_bytes([b[0], b[1]])) << 16))
            .collect()
    };
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use safetensors::tensor::{serialize_to_file, Dtype, TensorView};

    use super::{TensorF32, TensorSource, WeightError, WeightStore};

    fn tmp_file(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("soundclass-weights-{name}-{nanos}.safetensors"))
    }

    fn write(path: &PathBuf, tensors: &[(&str, Dtype, Vec<usize>, Vec<u8>)]) {
        let views = tensors.iter().map(|(name, dtype, shape, bytes)| {
            let view = TensorView::new(*dtype, shape.clone(), bytes).expect("view");
            (*name, view)
        });
        serialize_to_file(views, &None, path).expect("serialize safetensors");
    }

    #[test]
    fn reads_batch_norm_stats_in_f32_and_bf16() {
        let mean = [0.25f32, -1.5, 3.0];
        let mean_bytes: Vec<u8> = mean.iter().flat_map(|v| v.to_le_bytes()).collect();
        // 1.0 and -2.0 as bf16.
        let var_bytes: Vec<u8> = [0x3f80u16, 0xc000].iter().flat_map(|w| w.to_le_bytes()).collect();

        let path = tmp_file("bn");
        write(
            &path,
            &[
                ("conv1.1.running_mean", Dtype::F32, vec![3], mean_bytes),
                ("conv1.1.running_var", Dtype::BF16, vec![2], var_bytes),
            ],
        );

        let store = WeightStore::open(&path).expect("open");
        assert_eq!(
            store.names().expect("names"),
            vec!["conv1.1.running_mean".to_string(), "conv1.1.running_var".to_string()]
        );
        let m = store.tensor_f32("conv1.1.running_mean").expect("mean");
        assert_eq!(m, TensorF32::new(vec![3], mean.to_vec()));
        let v = store.tensor_f32("conv1.1.running_var").expect("var");
        assert_eq!(v.data, vec![1.0, -2.0]);

        assert!(matches!(
            store.tensor_f32("conv1.1.weight"),
            Err(WeightError::Missing(name)) if name == "conv1.1.weight"
        ));
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn integer_buffers_are_rejected() {
        // BatchNorm's num_batches_tracked is stored as i64.
        let path = tmp_file("i64");
        write(
            &path,
            &[("conv1.1.num_batches_tracked", Dtype::I64, vec![], 7i64.to_le_bytes().to_vec())],
        );
        let store = WeightStore::open(&path).expect("open");
        assert!(matches!(
            store.tensor_f32("conv1.1.num_batches_tracked"),
            Err(WeightError::UnsupportedDtype { dtype: Dtype::I64, .. })
        ));
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn open_rejects_non_safetensors_file() {
        let path = tmp_file("garbage");
        std::fs::write(&path, b"RIFF....WAVE").expect("write");
        assert!(WeightStore::open(&path).is_err());
        std::fs::remove_file(path).expect("cleanup");
    }

    #[test]
    fn in_memory_source_reports_missing() {
        let mut map = HashMap::new();
        map.insert("fc.bias".to_string(), TensorF32::new(vec![2], vec![0.0, 1.0]));
        assert_eq!(map.names().expect("names"), vec!["fc.bias".to_string()]);
        assert_eq!(map.tensor_f32("fc.bias").expect("bias").data, vec![0.0, 1.0]);
        assert!(matches!(map.tensor_f32("fc.weight"), Err(WeightError::Missing(_))));
    }
}
