//! llama.cpp backend via llama-cpp-2.
//!
//! The model is loaded once per `load` call and shared read-only. Each
//! completion creates a fresh context (LlamaContext is !Send, so it lives
//! entirely inside the blocking call).

use super::backend::{
    BackendError, Completion, CompletionRequest, ContextParams, InferenceBackend, TokenFlow,
};
use super::prompt::build_chatml_prompt;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use std::num::NonZeroU32;
use std::path::Path;

const BATCH_SIZE: usize = 512;

pub struct LlamaCppBackend {
    backend: LlamaBackend,
}

// Safety: LlamaBackend is a zero-sized init proof token, never mutated after
// `init`. LlamaModel is Send+Sync (declared by the crate).
unsafe impl Send for LlamaCppBackend {}
unsafe impl Sync for LlamaCppBackend {}

pub struct LlamaHandle {
    model: LlamaModel,
    context_size: u32,
}

impl LlamaCppBackend {
    pub fn new() -> Result<Self, BackendError> {
        let backend = LlamaBackend::init()
            .map_err(|e| BackendError(format!("Failed to init llama.cpp backend: {e:?}")))?;
        Ok(Self { backend })
    }
}

impl InferenceBackend for LlamaCppBackend {
    type Handle = LlamaHandle;

    fn load(&self, path: &Path, params: &ContextParams) -> Result<LlamaHandle, BackendError> {
        let mut model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        if params.use_mlock {
            model_params = model_params.with_use_mlock(true);
        }
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| BackendError(format!("Failed to load model: {e:?}")))?;
        Ok(LlamaHandle {
            model,
            context_size: params.context_size,
        })
    }

    fn release(&self, handle: LlamaHandle) {
        drop(handle);
    }

    fn complete(
        &self,
        handle: &LlamaHandle,
        request: &CompletionRequest,
        on_token: &mut dyn FnMut(&str) -> TokenFlow,
    ) -> Result<Completion, BackendError> {
        let model = &handle.model;
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(handle.context_size))
            .with_n_batch(BATCH_SIZE as u32);
        let mut ctx = model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| BackendError(format!("Context creation failed: {e:?}")))?;

        let prompt = build_chatml_prompt(&request.messages);
        let tokens = model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| BackendError(format!("Tokenization failed: {e:?}")))?;
        let prompt_len = tokens.len();
        if prompt_len >= handle.context_size as usize {
            return Err(BackendError(format!(
                "Prompt of {prompt_len} tokens does not fit a {} token context",
                handle.context_size
            )));
        }

        // Prefill in batch-sized chunks.
        let mut batch = LlamaBatch::new(BATCH_SIZE, 1);
        let last = prompt_len.saturating_sub(1);
        for (chunk_idx, chunk) in tokens.chunks(BATCH_SIZE).enumerate() {
            batch.clear();
            for (j, &token) in chunk.iter().enumerate() {
                let pos = chunk_idx * BATCH_SIZE + j;
                batch
                    .add(token, pos as i32, &[0], pos == last)
                    .map_err(|e| BackendError(format!("Batch add failed: {e:?}")))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| BackendError(format!("Prompt decode failed: {e:?}")))?;
        }

        let mut sampler = LlamaSampler::chain_simple([
            LlamaSampler::temp(0.7),
            LlamaSampler::top_k(40),
            LlamaSampler::top_p(0.9, 1),
            LlamaSampler::greedy(),
        ]);

        let budget = request
            .max_tokens
            .map(|n| n as usize)
            .unwrap_or(usize::MAX)
            .min(handle.context_size as usize - prompt_len);
        let eos = model.token_eos();
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        let mut n_decoded = 0u32;

        for _ in 0..budget {
            let token = sampler.sample(&ctx, -1);
            sampler.accept(token);
            if token == eos {
                break;
            }

            let piece = model
                .token_to_piece(token, &mut decoder, false, None)
                .unwrap_or_default();
            n_decoded += 1;
            if on_token(&piece) == TokenFlow::Stop {
                break;
            }

            batch.clear();
            batch
                .add(token, (prompt_len + n_decoded as usize - 1) as i32, &[0], true)
                .map_err(|e| BackendError(format!("Batch add failed: {e:?}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| BackendError(format!("Decode failed: {e:?}")))?;
        }

        Ok(Completion {
            tokens_predicted: n_decoded,
        })
    }
}
