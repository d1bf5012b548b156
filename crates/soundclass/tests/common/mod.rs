#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use safetensors::tensor::{serialize_to_file, Dtype, TensorView};
use soundclass::weights::TensorF32;

pub fn tmp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("soundclass-{name}-{nanos}"));
    std::fs::create_dir_all(&dir).expect("create tmp dir");
    dir
}

/// Write `classes.json` and `model.safetensors` into `dir`.
pub fn write_model_dir(dir: &Path, classes: &[&str], weights: &HashMap<String, TensorF32>) {
    let json = serde_json::to_string(classes).expect("classes json");
    std::fs::write(dir.join("classes.json"), json).expect("write classes");

    let bytes: Vec<(String, Vec<usize>, Vec<u8>)> = weights
        .iter()
        .map(|(name, t)| {
            let raw = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.clone(), t.shape.clone(), raw)
        })
        .collect();
    let views = bytes.iter().map(|(name, shape, raw)| {
        let view = TensorView::new(Dtype::F32, shape.clone(), raw).expect("tensor view");
        (name.as_str(), view)
    });
    serialize_to_file(views, &None, &dir.join("model.safetensors")).expect("write safetensors");
}

pub fn wav_bytes(samples: &[f32], sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
        for &s in samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            writer.write_sample(v).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }
    cursor.into_inner()
}
