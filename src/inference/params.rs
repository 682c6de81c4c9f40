use std::fmt::Display;
use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_PROMPT: &str = "What can you tell me about this audio?";

/// Code used in place of language detection when the caller asks for `Auto-detect`.
pub const FALLBACK_LANGUAGE_CODE: &str = "en";

/// Maps every selectable language name to its short code.
pub const LANGUAGE_TABLE: [(Language, &str); 11] = [
    (Language::English, "en"),
    (Language::French, "fr"),
    (Language::German, "de"),
    (Language::Spanish, "es"),
    (Language::Italian, "it"),
    (Language::Portuguese, "pt"),
    (Language::Dutch, "nl"),
    (Language::Russian, "ru"),
    (Language::Chinese, "zh"),
    (Language::Japanese, "ja"),
    (Language::Arabic, "ar"),
];

#[derive(Deserialize, Serialize, Debug, Copy, Clone, Default, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Convert speech to text
    #[default]
    Transcription,
    /// Answer a free-text prompt about the audio content
    Understanding,
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, Default, PartialEq, Eq, Hash, ValueEnum)]
#[value(rename_all = "verbatim")]
pub enum Language {
    #[default]
    #[serde(rename = "Auto-detect")]
    #[value(name = "Auto-detect")]
    Auto,
    English,
    French,
    German,
    Spanish,
    Italian,
    Portuguese,
    Dutch,
    Russian,
    Chinese,
    Japanese,
    Arabic,
}

impl Language {
    /// Resolves the language to the code handed to the transcription request builder.
    ///
    /// `Auto` does not detect anything, it always resolves to [`FALLBACK_LANGUAGE_CODE`].
    pub fn code(self) -> &'static str {
        LANGUAGE_TABLE
            .iter()
            .find(|(language, _)| *language == self)
            .map_or(FALLBACK_LANGUAGE_CODE, |(_, code)| *code)
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::Auto => write!(f, "Auto-detect"),
            language => write!(f, "{language:?}"),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Copy, Clone, Default, PartialEq, Eq, Hash, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    /// Compact variant (3B), faster and lighter on memory
    #[default]
    Mini,
    /// Large variant (24B), more accurate on complex audio
    Small,
}

impl Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSize::Mini => write!(f, "mini"),
            ModelSize::Small => write!(f, "small"),
        }
    }
}

/// Upper bound on newly generated tokens, always within `MIN..=MAX`.
#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "usize", into = "usize")]
pub struct TokenBudget(usize);

impl TokenBudget {
    pub const MIN: usize = 50;
    pub const MAX: usize = 1000;

    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        TokenBudget(500)
    }
}

impl TryFrom<usize> for TokenBudget {
    type Error = Error;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        if !(Self::MIN..=Self::MAX).contains(&value) {
            bail!(
                "max_tokens must be between {} and {}, got {}",
                Self::MIN,
                Self::MAX,
                value
            )
        }
        Ok(TokenBudget(value))
    }
}

impl From<TokenBudget> for usize {
    fn from(budget: TokenBudget) -> Self {
        budget.0
    }
}

/// Request fields that travel alongside the audio upload.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PredictOptions {
    pub mode: Mode,
    pub prompt: String,
    pub language: Language,
    pub model_size: ModelSize,
    pub max_tokens: TokenBudget,
}

impl Default for PredictOptions {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            prompt: DEFAULT_PROMPT.to_string(),
            language: Language::default(),
            model_size: ModelSize::default(),
            max_tokens: TokenBudget::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictRequest {
    pub audio: PathBuf,
    pub options: PredictOptions,
}

impl PredictRequest {
    pub fn new(audio: impl Into<PathBuf>, options: PredictOptions) -> Self {
        Self {
            audio: audio.into(),
            options,
        }
    }
}
