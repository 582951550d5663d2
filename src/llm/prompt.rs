//! ChatML prompt rendering for the llama.cpp backend.
//!
//! Format: `<|im_start|>{role}\n{content}<|im_end|>\n` per message, followed by
//! an open `<|im_start|>assistant\n` turn for the model to complete.

use super::backend::ChatMessage;

pub fn build_chatml_prompt(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(message.role.as_str());
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}
