use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::voxtral::{
    extract_features, VoxtralConfig, VoxtralForConditionalGeneration, VoxtralGenerationConfig,
    VoxtralLlamaConfig,
};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::de::DeserializeOwned;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::hub_api;
use crate::config::Config;
use crate::inference::context::{InferenceContext, ModelBundle};
use crate::inference::device::{device_name, select_device, MODEL_DTYPE};
use crate::inference::model::ModelBase;
use crate::inference::params::ModelSize;
use crate::inference::pcm_decode::{AudioClip, SAMPLE_RATE};
use crate::inference::processor::{AudioProcessor, ChatContent, ChatMessage, Generator, ModelInputs};

const CONFIG_FILENAME: &str = "config.json";
const TOKENIZER_FILENAME: &str = "tokenizer.json";
const WEIGHTS_INDEX_FILENAME: &str = "model.safetensors.index.json";
const WEIGHTS_FILENAME: &str = "model.safetensors";

/// Audio is fed to the encoder in windows of 30 seconds.
const CHUNK_SAMPLES: usize = 30 * SAMPLE_RATE as usize;
/// 3000 mel frames per window, halved by the encoder and downsampled 4x by the projector.
const AUDIO_TOKENS_PER_CHUNK: usize = 375;

pub type VoxtralContext = InferenceContext<VoxtralProcessor, VoxtralGenerator>;

/// Downloads both Voxtral variants and places them on the selected device.
#[tracing::instrument(level = "info", skip(config))]
pub fn setup(config: &Config) -> Result<VoxtralContext> {
    let device = select_device(config.cpu)?;
    info!("Using device: {}", device_name(&device));

    let api = hub_api(Path::new(&config.cache_dir))?;
    let mel_filters = read_mel_filters(Path::new(&config.mel_filters_path))?;

    let mini = load_bundle(&api, config.model_base(ModelSize::Mini), &mel_filters, &device)?;
    let small = load_bundle(&api, config.model_base(ModelSize::Small), &mel_filters, &device)?;
    info!("Models loaded successfully");

    InferenceContext::new(device, MODEL_DTYPE, mini, small)
}

#[tracing::instrument(level = "info", skip(api, mel_filters, device), fields(repo_id = %base.repo_id))]
fn load_bundle(
    api: &Api,
    base: ModelBase,
    mel_filters: &[f32],
    device: &Device,
) -> Result<ModelBundle<VoxtralProcessor, VoxtralGenerator>> {
    info!("Loading {} model...", base.name);
    let repo = api.repo(Repo::with_revision(
        base.repo_id.clone(),
        RepoType::Model,
        base.repo_revision.clone(),
    ));

    let processor = VoxtralProcessor::from_repo(&repo, mel_filters.to_vec())?;
    let generator = VoxtralGenerator::from_repo(&repo, device)?;

    Ok(ModelBundle {
        base,
        processor,
        generator,
    })
}

fn read_mel_filters(path: &Path) -> Result<Vec<f32>> {
    let mel_bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read mel filters from {}", path.display()))?;
    if mel_bytes.is_empty() || mel_bytes.len() % 4 != 0 {
        bail!("Mel filter file {} is not a list of f32", path.display())
    }
    let mut mel_filters = vec![0f32; mel_bytes.len() / 4];
    <byteorder::LittleEndian as byteorder::ByteOrder>::read_f32_into(&mel_bytes, &mut mel_filters);
    Ok(mel_filters)
}

/// Lists the safetensors shards of a repository, or its single weights file.
fn safetensors_files(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    let Ok(index_path) = repo.get(WEIGHTS_INDEX_FILENAME) else {
        return Ok(vec![repo.get(WEIGHTS_FILENAME)?]);
    };
    let index: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(index_path)?)?;
    let Some(weight_map) = index.get("weight_map").and_then(|map| map.as_object()) else {
        bail!("No weight map in {WEIGHTS_INDEX_FILENAME}")
    };
    let shards: BTreeSet<&str> = weight_map.values().filter_map(|v| v.as_str()).collect();
    shards
        .into_iter()
        .map(|shard| repo.get(shard).map_err(Error::from))
        .collect()
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    match tokenizer.token_to_id(token) {
        None => bail!("no token-id for {token}"),
        Some(id) => Ok(id),
    }
}

#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    bos: u32,
    inst: u32,
    inst_end: u32,
    begin_audio: u32,
    audio: u32,
    transcribe: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        Ok(Self {
            bos: token_id(tokenizer, "<s>")?,
            inst: token_id(tokenizer, "[INST]")?,
            inst_end: token_id(tokenizer, "[/INST]")?,
            begin_audio: token_id(tokenizer, "[BEGIN_AUDIO]")?,
            audio: token_id(tokenizer, "[AUDIO]")?,
            transcribe: token_id(tokenizer, "[TRANSCRIBE]")?,
        })
    }
}

/// Input ids (batch of one) and, when audio is present, its mel features.
#[derive(Debug, Clone)]
pub struct VoxtralInputs {
    input_ids: Tensor,
    input_features: Option<Tensor>,
}

impl VoxtralInputs {
    fn new(ids: &[u32], input_features: Option<Tensor>) -> Result<Self> {
        let input_ids = Tensor::new(ids, &Device::Cpu)?.unsqueeze(0)?;
        Ok(Self {
            input_ids,
            input_features,
        })
    }
}

impl ModelInputs for VoxtralInputs {
    fn input_len(&self) -> usize {
        self.input_ids.dims().last().copied().unwrap_or(0)
    }

    fn to_device(self, device: &Device, dtype: DType) -> Result<Self> {
        let input_features = match self.input_features {
            Some(features) => Some(features.to_device(device)?.to_dtype(dtype)?),
            None => None,
        };
        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            input_features,
        })
    }
}

pub struct VoxtralProcessor {
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    special: SpecialTokens,
}

impl VoxtralProcessor {
    pub fn from_repo(repo: &ApiRepo, mel_filters: Vec<f32>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(repo.get(TOKENIZER_FILENAME)?).map_err(Error::msg)?;
        Self::new(tokenizer, mel_filters)
    }

    pub fn new(tokenizer: Tokenizer, mel_filters: Vec<f32>) -> Result<Self> {
        let special = SpecialTokens::from_tokenizer(&tokenizer)?;
        Ok(Self {
            tokenizer,
            mel_filters,
            special,
        })
    }

    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false).map_err(Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Mel features of the clip padded to whole windows, and the number of audio tokens they fill.
    fn audio_features(&self, audio: &AudioClip) -> Result<(Tensor, usize)> {
        let windows = audio.samples.len().div_ceil(CHUNK_SAMPLES).max(1);
        let mut samples = audio.samples.clone();
        samples.resize(windows * CHUNK_SAMPLES, 0.0);

        // The extractor appends a silent window of its own
        let features = extract_features(&samples, &self.mel_filters, &Device::Cpu)?
            .narrow(0, 0, windows)?;
        debug!("audio features: {:?}", features.dims());
        Ok((features, windows * AUDIO_TOKENS_PER_CHUNK))
    }

    fn push_audio(&self, ids: &mut Vec<u32>, audio_tokens: usize) {
        ids.push(self.special.begin_audio);
        ids.extend(std::iter::repeat(self.special.audio).take(audio_tokens));
    }
}

impl AudioProcessor for VoxtralProcessor {
    type Inputs = VoxtralInputs;

    /// `<s>[INST][BEGIN_AUDIO][AUDIO]..[/INST]lang:xx[TRANSCRIBE]`
    fn apply_transcription_request(
        &self,
        language: &str,
        audio: &AudioClip,
        model_id: &str,
    ) -> Result<VoxtralInputs> {
        debug!("building transcription request for {model_id}");
        let (features, audio_tokens) = self.audio_features(audio)?;

        let mut ids = vec![self.special.bos, self.special.inst];
        self.push_audio(&mut ids, audio_tokens);
        ids.push(self.special.inst_end);
        ids.extend(self.encode_text(&format!("lang:{language}"))?);
        ids.push(self.special.transcribe);

        VoxtralInputs::new(&ids, Some(features))
    }

    /// `<s>[INST]` followed by each content item in order, then `[/INST]`.
    fn apply_chat_template(&self, conversation: &[ChatMessage<'_>]) -> Result<VoxtralInputs> {
        if conversation.is_empty() {
            bail!("Conversation is empty")
        }
        let mut ids = vec![self.special.bos];
        let mut features = vec![];
        for message in conversation {
            ids.push(self.special.inst);
            for item in &message.content {
                match item {
                    ChatContent::Audio(audio) => {
                        let (audio_features, audio_tokens) = self.audio_features(audio)?;
                        self.push_audio(&mut ids, audio_tokens);
                        features.push(audio_features);
                    }
                    ChatContent::Text(text) => ids.extend(self.encode_text(text)?),
                }
            }
            ids.push(self.special.inst_end);
        }

        let features = match features.len() {
            0 => None,
            1 => features.pop(),
            _ => Some(Tensor::cat(&features, 0)?),
        };
        VoxtralInputs::new(&ids, features)
    }

    fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(tokens, skip_special_tokens)
            .map_err(Error::msg)
    }
}

pub struct VoxtralGenerator {
    model: VoxtralForConditionalGeneration,
    device: Device,
}

impl VoxtralGenerator {
    pub fn from_repo(repo: &ApiRepo, device: &Device) -> Result<Self> {
        let config = voxtral_config(&std::fs::read_to_string(repo.get(CONFIG_FILENAME)?)?)?;
        let weights = safetensors_files(repo)?;
        debug!("loading {} weight files", weights.len());

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, MODEL_DTYPE, device)? };
        let model = VoxtralForConditionalGeneration::new(&config, vb)?;

        Ok(Self {
            model,
            device: device.clone(),
        })
    }
}

impl Generator for VoxtralGenerator {
    type Inputs = VoxtralInputs;

    fn generate(&self, inputs: &VoxtralInputs, max_new_tokens: usize) -> Result<Vec<u32>> {
        let prompt = inputs.input_ids.squeeze(0)?.to_vec1::<u32>()?;
        let generation_config = VoxtralGenerationConfig {
            max_new_tokens,
            temperature: 0.0,
            top_p: None,
            device: self.device.clone(),
            cache: None,
        };

        let generated = self.model.generate(
            &inputs.input_ids,
            inputs.input_features.as_ref(),
            generation_config,
        )?;
        Ok(prompt_then_new_tokens(&prompt, &generated, max_new_tokens))
    }
}

/// Lays out generated ids as the prompt followed by at most `max_new_tokens` new ids,
/// whether or not the model echoed the prompt back.
fn prompt_then_new_tokens(prompt: &[u32], generated: &[u32], max_new_tokens: usize) -> Vec<u32> {
    let new_tokens = generated.strip_prefix(prompt).unwrap_or(generated);
    let mut output = prompt.to_vec();
    output.extend(new_tokens.iter().take(max_new_tokens));
    output
}

/// Builds the model config from the checkpoint's `config.json`.
///
/// Only the text section deserializes as is, the encoder section is read field by field
/// over the library defaults.
fn voxtral_config(raw: &str) -> Result<VoxtralConfig> {
    let raw: serde_json::Value = serde_json::from_str(raw)?;
    let defaults = VoxtralConfig::default();

    let mut text = raw
        .get("text_config")
        .cloned()
        .context("No text_config in config.json")?;
    if let Some(fields) = text.as_object_mut() {
        fields.entry("use_flash_attn").or_insert(false.into());
        fields.entry("tie_word_embeddings").or_insert(false.into());
    }
    let text_config: VoxtralLlamaConfig =
        serde_json::from_value(text).context("Invalid text_config in config.json")?;

    let audio = raw
        .get("audio_config")
        .context("No audio_config in config.json")?;
    let mut audio_config = defaults.audio_config;
    read_field(audio, "vocab_size", &mut audio_config.vocab_size)?;
    read_field(audio, "hidden_size", &mut audio_config.hidden_size)?;
    read_field(audio, "intermediate_size", &mut audio_config.intermediate_size)?;
    read_field(audio, "num_hidden_layers", &mut audio_config.num_hidden_layers)?;
    read_field(audio, "num_attention_heads", &mut audio_config.num_attention_heads)?;
    read_field(audio, "num_key_value_heads", &mut audio_config.num_key_value_heads)?;
    read_field(audio, "head_dim", &mut audio_config.head_dim)?;
    read_field(audio, "scale_embedding", &mut audio_config.scale_embedding)?;
    read_field(audio, "activation_function", &mut audio_config.activation_function)?;
    read_field(audio, "num_mel_bins", &mut audio_config.num_mel_bins)?;
    read_field(audio, "max_source_positions", &mut audio_config.max_source_positions)?;
    read_field(audio, "initializer_range", &mut audio_config.initializer_range)?;
    read_field(audio, "attention_dropout", &mut audio_config.attention_dropout)?;

    let mut audio_token_id = defaults.audio_token_id;
    let mut projector_hidden_act = defaults.projector_hidden_act;
    read_field(&raw, "audio_token_id", &mut audio_token_id)?;
    read_field(&raw, "projector_hidden_act", &mut projector_hidden_act)?;

    Ok(VoxtralConfig {
        audio_config: audio_config.with_whisper_compatibility(),
        text_config,
        audio_token_id,
        projector_hidden_act,
    })
}

/// Overwrites `field` when `section` sets `key`.
fn read_field<T: DeserializeOwned>(section: &serde_json::Value, key: &str, field: &mut T) -> Result<()> {
    if let Some(value) = section.get(key).filter(|value| !value.is_null()) {
        *field = serde_json::from_value(value.clone())
            .with_context(|| format!("Invalid {key} in config.json"))?;
    }
    Ok(())
}
