//! Known downloadable models — descriptors and the built-in table.
//!
//! Each entry names the source URL, the file name it is stored under and an
//! optional SHA-256 for verification after download.

use serde::{Deserialize, Serialize};

/// Immutable metadata for one downloadable model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescriptor {
    pub id: String,
    pub name: String,
    /// Human readable, e.g. "1.1 GB".
    pub size: String,
    pub source_url: String,
    pub local_file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ModelDescriptor {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        size: impl Into<String>,
        source_url: impl Into<String>,
        local_file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            size: size.into(),
            source_url: source_url.into(),
            local_file_name: local_file_name.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, hash: impl Into<String>) -> Self {
        self.sha256 = Some(hash.into());
        self
    }
}

struct BuiltinModel {
    id: &'static str,
    name: &'static str,
    size: &'static str,
    url: &'static str,
    filename: &'static str,
}

/// Small instruct models that fit on a phone. All Q4_K_M or similar.
static BUILTIN_MODELS: &[BuiltinModel] = &[
    BuiltinModel {
        id: "qwen2.5-0.5b-q4km",
        name: "Qwen 2.5 0.5B Instruct",
        size: "398 MB",
        url: "https://huggingface.co/Qwen/Qwen2.5-0.5B-Instruct-GGUF/resolve/main/qwen2.5-0.5b-instruct-q4_k_m.gguf",
        filename: "qwen2.5-0.5b-instruct-q4_k_m.gguf",
    },
    BuiltinModel {
        id: "qwen2.5-1.5b-q4km",
        name: "Qwen 2.5 1.5B Instruct",
        size: "1.1 GB",
        url: "https://huggingface.co/Qwen/Qwen2.5-1.5B-Instruct-GGUF/resolve/main/qwen2.5-1.5b-instruct-q4_k_m.gguf",
        filename: "qwen2.5-1.5b-instruct-q4_k_m.gguf",
    },
    BuiltinModel {
        id: "llama3.2-1b-q4km",
        name: "Llama 3.2 1B Instruct",
        size: "808 MB",
        url: "https://huggingface.co/bartowski/Llama-3.2-1B-Instruct-GGUF/resolve/main/Llama-3.2-1B-Instruct-Q4_K_M.gguf",
        filename: "Llama-3.2-1B-Instruct-Q4_K_M.gguf",
    },
    BuiltinModel {
        id: "smollm2-1.7b-q4km",
        name: "SmolLM2 1.7B Instruct",
        size: "1.1 GB",
        url: "https://huggingface.co/HuggingFaceTB/SmolLM2-1.7B-Instruct-GGUF/resolve/main/smollm2-1.7b-instruct-q4_k_m.gguf",
        filename: "smollm2-1.7b-instruct-q4_k_m.gguf",
    },
];

/// Descriptors for every built-in model, in display order.
pub fn builtin_descriptors() -> Vec<ModelDescriptor> {
    BUILTIN_MODELS
        .iter()
        .map(|m| ModelDescriptor::new(m.id, m.name, m.size, m.url, m.filename))
        .collect()
}

/// Look up a built-in model by ID.
pub fn find_builtin(id: &str) -> Option<ModelDescriptor> {
    builtin_descriptors().into_iter().find(|m| m.id == id)
}
