use anyhow::Result;
use candle_core::{DType, Device};
use serde::Serialize;

use crate::inference::pcm_decode::AudioClip;

#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone, Copy)]
pub enum ChatContent<'a> {
    Audio(&'a AudioClip),
    Text(&'a str),
}

#[derive(Debug, Clone)]
pub struct ChatMessage<'a> {
    pub role: Role,
    pub content: Vec<ChatContent<'a>>,
}

pub type Conversation<'a> = Vec<ChatMessage<'a>>;

/// Model-ready inputs produced by an [`AudioProcessor`].
pub trait ModelInputs: Sized {
    /// Number of prompt tokens, which the generator echoes at the start of its output.
    fn input_len(&self) -> usize;

    /// Moves every tensor onto `device`, casting floating point features to `dtype`.
    fn to_device(self, device: &Device, dtype: DType) -> Result<Self>;
}

/// Turns audio and text into model inputs, and token ids back into text.
pub trait AudioProcessor {
    type Inputs: ModelInputs;

    /// Builds a transcription request for `language` (a short code such as `en`).
    fn apply_transcription_request(
        &self,
        language: &str,
        audio: &AudioClip,
        model_id: &str,
    ) -> Result<Self::Inputs>;

    fn apply_chat_template(&self, conversation: &[ChatMessage<'_>]) -> Result<Self::Inputs>;

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String>;
}

/// Autoregressive generation bounded by a number of new tokens.
pub trait Generator {
    type Inputs: ModelInputs;

    /// Returns the input ids followed by at most `max_new_tokens` generated ids.
    fn generate(&self, inputs: &Self::Inputs, max_new_tokens: usize) -> Result<Vec<u32>>;
}
