#![allow(dead_code)]

use std::path::{Path, PathBuf};

use ggufmount::codec::{
    ArchiveModel, MetadataEntry, MetadataValue, TensorDescriptor, TensorPayload, TensorType,
};

pub const TOKENS: [&str; 7] = ["A", "<end>", "filler", "<end>", "filler", "<end>", "B"];

pub fn string(s: &str) -> MetadataValue {
    MetadataValue::String(s.into())
}

/// Metadata of a small llama archive with one telemetry key and a
/// tokenizer carrying one pathological run.
pub fn llama_metadata() -> Vec<MetadataEntry> {
    vec![
        MetadataEntry::new("general.architecture", string("llama")),
        MetadataEntry::new("general.name", string("tiny")),
        MetadataEntry::new("general.license", string("mit")),
        MetadataEntry::new("llama.block_count", MetadataValue::U32(1)),
        MetadataEntry::new("tokenizer.ggml.model", string("llama")),
        MetadataEntry::new("tokenizer.ggml.tokens", MetadataValue::string_array(TOKENS)),
    ]
}

/// Two tensors so the second one's offset depends on alignment.
pub fn tensors() -> (Vec<TensorDescriptor>, TensorPayload) {
    let tensors = vec![
        TensorDescriptor {
            name: "output.weight".into(),
            dims: vec![8],
            tensor_type: TensorType::F32,
            offset: 0,
            byte_len: 32,
        },
        TensorDescriptor {
            name: "norm.weight".into(),
            dims: vec![3],
            tensor_type: TensorType::F16,
            offset: 32,
            byte_len: 6,
        },
    ];
    let payload: Vec<u8> = (0u8..38).map(|b| b.wrapping_mul(7)).collect();
    (tensors, TensorPayload::whole(payload))
}

pub fn write_archive(dir: &Path, name: &str, metadata: Vec<MetadataEntry>) -> PathBuf {
    let path = dir.join(name);
    let (tensors, payload) = tensors();
    let bytes = ArchiveModel::from_parts(3, metadata, tensors, payload, 32).serialize().unwrap();
    std::fs::write(&path, bytes).unwrap();
    path
}

pub fn parse(path: &Path) -> ArchiveModel {
    ArchiveModel::parse(std::fs::read(path).unwrap()).unwrap()
}

pub fn keys(model: &ArchiveModel) -> Vec<&str> {
    model.metadata().iter().map(|e| e.key.as_str()).collect()
}
