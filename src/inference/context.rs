use anyhow::{bail, Result};
use candle_core::{DType, Device};
use tracing::info;

use crate::inference::model::ModelBase;
use crate::inference::params::{Language, Mode, ModelSize, PredictRequest, TokenBudget};
use crate::inference::pcm_decode::AudioClip;
use crate::inference::processor::{
    AudioProcessor, ChatContent, ChatMessage, Generator, ModelInputs, Role,
};

/// A loaded processor and generator pair, never split apart once built.
pub struct ModelBundle<P, G> {
    pub base: ModelBase,
    pub processor: P,
    pub generator: G,
}

/// Everything loaded once at startup and shared read-only by every request.
pub struct InferenceContext<P, G> {
    device: Device,
    dtype: DType,
    mini: ModelBundle<P, G>,
    small: ModelBundle<P, G>,
}

/// Entry point the hosting layer calls for each request.
pub trait Predictor: Send + Sync {
    fn predict(&self, request: &PredictRequest) -> Result<String>;

    fn models(&self) -> Vec<ModelBase>;
}

impl<P, G> InferenceContext<P, G>
where
    P: AudioProcessor,
    G: Generator<Inputs = P::Inputs>,
{
    pub fn new(
        device: Device,
        dtype: DType,
        mini: ModelBundle<P, G>,
        small: ModelBundle<P, G>,
    ) -> Result<Self> {
        if mini.base.size != ModelSize::Mini || small.base.size != ModelSize::Small {
            bail!(
                "Bundles loaded in the wrong slots: got {} and {}",
                mini.base.size,
                small.base.size
            )
        }
        Ok(Self {
            device,
            dtype,
            mini,
            small,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn bundle(&self, size: ModelSize) -> &ModelBundle<P, G> {
        match size {
            ModelSize::Mini => &self.mini,
            ModelSize::Small => &self.small,
        }
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub fn predict(&self, request: &PredictRequest) -> Result<String> {
        let options = &request.options;
        let audio = AudioClip::load(&request.audio)?;

        let bundle = self.bundle(options.model_size);
        info!("Using {} model", bundle.base.name);
        info!("Mode: {:?}", options.mode);

        match options.mode {
            Mode::Transcription => {
                self.transcribe(bundle, &audio, options.language, options.max_tokens)
            }
            Mode::Understanding => {
                self.understand(bundle, &audio, &options.prompt, options.max_tokens)
            }
        }
    }

    #[tracing::instrument(level = "info", skip(self, bundle, audio))]
    fn transcribe(
        &self,
        bundle: &ModelBundle<P, G>,
        audio: &AudioClip,
        language: Language,
        max_tokens: TokenBudget,
    ) -> Result<String> {
        if language == Language::Auto {
            info!("Auto-detecting language (using English as fallback)");
        } else {
            info!("Transcribing in {language}");
        }
        let inputs = bundle.processor.apply_transcription_request(
            language.code(),
            audio,
            &bundle.base.repo_id,
        )?;

        let transcription = self.generate_and_decode(bundle, inputs, max_tokens)?;
        info!("Transcription completed: {} characters", transcription.len());
        Ok(transcription)
    }

    #[tracing::instrument(level = "info", skip(self, bundle, audio))]
    fn understand(
        &self,
        bundle: &ModelBundle<P, G>,
        audio: &AudioClip,
        prompt: &str,
        max_tokens: TokenBudget,
    ) -> Result<String> {
        let conversation = [ChatMessage {
            role: Role::User,
            content: vec![ChatContent::Audio(audio), ChatContent::Text(prompt)],
        }];
        let inputs = bundle.processor.apply_chat_template(&conversation)?;

        let response = self.generate_and_decode(bundle, inputs, max_tokens)?;
        info!("Audio understanding completed: {} characters", response.len());
        Ok(response)
    }

    /// Runs generation and decodes only the tokens produced after the prompt.
    fn generate_and_decode(
        &self,
        bundle: &ModelBundle<P, G>,
        inputs: P::Inputs,
        max_tokens: TokenBudget,
    ) -> Result<String> {
        let inputs = inputs.to_device(&self.device, self.dtype)?;
        let input_len = inputs.input_len();

        let outputs = bundle.generator.generate(&inputs, max_tokens.get())?;
        let Some(new_tokens) = outputs.get(input_len..) else {
            bail!(
                "Generator returned {} tokens for an input of {}",
                outputs.len(),
                input_len
            )
        };
        if new_tokens.len() > max_tokens.get() {
            bail!(
                "Generator produced {} tokens, more than the budget of {}",
                new_tokens.len(),
                max_tokens.get()
            )
        }

        let text = bundle.processor.decode(new_tokens, true)?;
        Ok(text.trim().to_string())
    }
}

impl<P, G> Predictor for InferenceContext<P, G>
where
    P: AudioProcessor + Send + Sync,
    G: Generator<Inputs = P::Inputs> + Send + Sync,
{
    fn predict(&self, request: &PredictRequest) -> Result<String> {
        InferenceContext::predict(self, request)
    }

    fn models(&self) -> Vec<ModelBase> {
        vec![self.mini.base.clone(), self.small.base.clone()]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::f32::consts::PI;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use tempfile::TempDir;

    use super::*;
    use crate::inference::model::{VOXTRAL_MINI_REPO_ID, VOXTRAL_SMALL_REPO_ID};
    use crate::inference::params::PredictOptions;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) struct FakeInputs {
        pub(crate) ids: Vec<u32>,
        pub(crate) dtype: Option<DType>,
    }

    impl ModelInputs for FakeInputs {
        fn input_len(&self) -> usize {
            self.ids.len()
        }

        fn to_device(self, _device: &Device, dtype: DType) -> Result<Self> {
            Ok(Self {
                dtype: Some(dtype),
                ..self
            })
        }
    }

    /// Encodes the bundle tag as the first input id so the generator can tell who built it.
    pub(crate) struct FakeProcessor {
        pub(crate) tag: u32,
        pub(crate) log: Arc<Mutex<Vec<String>>>,
    }

    impl AudioProcessor for FakeProcessor {
        type Inputs = FakeInputs;

        fn apply_transcription_request(
            &self,
            language: &str,
            audio: &AudioClip,
            model_id: &str,
        ) -> Result<FakeInputs> {
            self.log
                .lock()
                .unwrap()
                .push(format!("transcribe {language} {model_id}"));
            Ok(FakeInputs {
                ids: vec![self.tag, 1, 2, audio.samples.len() as u32],
                dtype: None,
            })
        }

        fn apply_chat_template(&self, conversation: &[ChatMessage<'_>]) -> Result<FakeInputs> {
            let items: Vec<String> = conversation
                .iter()
                .flat_map(|message| message.content.iter())
                .map(|item| match item {
                    ChatContent::Audio(_) => "audio".to_string(),
                    ChatContent::Text(text) => format!("text={text}"),
                })
                .collect();
            self.log
                .lock()
                .unwrap()
                .push(format!("chat {} [{}]", conversation.len(), items.join(", ")));
            Ok(FakeInputs {
                ids: vec![self.tag, 9],
                dtype: None,
            })
        }

        fn decode(&self, tokens: &[u32], _skip_special_tokens: bool) -> Result<String> {
            let words: Vec<String> = tokens.iter().map(|t| format!("w{t}")).collect();
            Ok(format!("  {} \n", words.join(" ")))
        }
    }

    /// Ways a generator can break its output contract.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Contract {
        Honored,
        DropsPrompt,
        IgnoresBudget,
    }

    pub(crate) struct FakeGenerator {
        pub(crate) tag: u32,
        pub(crate) reply_len: usize,
        pub(crate) contract: Contract,
        pub(crate) calls: Arc<AtomicUsize>,
    }

    impl Generator for FakeGenerator {
        type Inputs = FakeInputs;

        fn generate(&self, inputs: &FakeInputs, max_new_tokens: usize) -> Result<Vec<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if inputs.ids.first() != Some(&self.tag) {
                bail!("inputs built by another bundle")
            }
            if inputs.dtype != Some(DType::BF16) {
                bail!("inputs were not moved to the device")
            }
            let reply_len = match self.contract {
                Contract::Honored => self.reply_len.min(max_new_tokens),
                Contract::DropsPrompt => return Ok(inputs.ids[1..].to_vec()),
                Contract::IgnoresBudget => max_new_tokens + 1,
            };
            let mut output = inputs.ids.clone();
            output.extend((0..reply_len).map(|i| self.tag * 1000 + i as u32));
            Ok(output)
        }
    }

    pub(crate) struct Harness {
        pub(crate) context: InferenceContext<FakeProcessor, FakeGenerator>,
        pub(crate) log: Arc<Mutex<Vec<String>>>,
        pub(crate) calls: Arc<AtomicUsize>,
    }

    pub(crate) fn harness(reply_len: usize) -> Harness {
        harness_with(reply_len, Contract::Honored)
    }

    pub(crate) fn harness_with(reply_len: usize, contract: Contract) -> Harness {
        let log = Arc::new(Mutex::new(vec![]));
        let calls = Arc::new(AtomicUsize::new(0));
        let bundle = |size, repo_id: &str, tag| ModelBundle {
            base: ModelBase::voxtral(size, repo_id, "main"),
            processor: FakeProcessor {
                tag,
                log: log.clone(),
            },
            generator: FakeGenerator {
                tag,
                reply_len,
                contract,
                calls: calls.clone(),
            },
        };
        let context = InferenceContext::new(
            Device::Cpu,
            DType::BF16,
            bundle(ModelSize::Mini, VOXTRAL_MINI_REPO_ID, 1),
            bundle(ModelSize::Small, VOXTRAL_SMALL_REPO_ID, 2),
        )
        .unwrap();
        Harness {
            context,
            log,
            calls,
        }
    }

    pub(crate) fn write_tone(dir: &Path) -> PathBuf {
        let path = dir.join("tone.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for i in 0..1600 {
            let value = (2.0 * PI * 220.0 * i as f32 / 16_000.0).sin();
            writer.write_sample((value * 6000.0) as i16).unwrap();
        }
        writer.finalize().unwrap();
        path
    }

    fn request(audio: &Path, json: &str) -> PredictRequest {
        PredictRequest::new(audio, serde_json::from_str::<PredictOptions>(json).unwrap())
    }

    #[test]
    fn transcription_routes_to_requested_bundle() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness(3);

        let mini = h
            .context
            .predict(&request(&audio, r#"{"language":"French"}"#))
            .unwrap();
        assert_eq!(mini, "w1000 w1001 w1002");

        let small = h
            .context
            .predict(&request(&audio, r#"{"model_size":"small","language":"German"}"#))
            .unwrap();
        assert_eq!(small, "w2000 w2001 w2002");

        let log = h.log.lock().unwrap();
        assert_eq!(log[0], format!("transcribe fr {VOXTRAL_MINI_REPO_ID}"));
        assert_eq!(log[1], format!("transcribe de {VOXTRAL_SMALL_REPO_ID}"));
    }

    #[test]
    fn auto_detect_behaves_like_english() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness(4);

        let auto = h
            .context
            .predict(&request(&audio, r#"{"language":"Auto-detect"}"#))
            .unwrap();
        let english = h
            .context
            .predict(&request(&audio, r#"{"language":"English"}"#))
            .unwrap();
        assert_eq!(auto, english);

        let log = h.log.lock().unwrap();
        assert_eq!(log[0], log[1]);
        assert!(log[0].starts_with("transcribe en "));
    }

    #[test]
    fn understanding_builds_single_user_turn() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness(2);

        let response = h
            .context
            .predict(&request(
                &audio,
                r#"{"mode":"understanding","prompt":"Summarize this audio","model_size":"small"}"#,
            ))
            .unwrap();
        assert_eq!(response, "w2000 w2001");
        assert_eq!(
            h.log.lock().unwrap()[0],
            "chat 1 [audio, text=Summarize this audio]"
        );
    }

    #[test]
    fn output_excludes_prompt_and_respects_budget() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness(700);

        let short = h
            .context
            .predict(&request(&audio, r#"{"max_tokens":50}"#))
            .unwrap();
        let long = h
            .context
            .predict(&request(&audio, r#"{"max_tokens":1000}"#))
            .unwrap();

        let short_tokens = short.split_whitespace().count();
        let long_tokens = long.split_whitespace().count();
        assert_eq!(short_tokens, 50);
        assert_eq!(long_tokens, 700);
        assert!(short.split_whitespace().all(|w| w.starts_with("w1")));
        assert_eq!(short, short.trim());
    }

    #[test]
    fn repeated_calls_are_identical() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness(10);
        let req = request(&audio, r#"{"mode":"understanding"}"#);

        assert_eq!(
            h.context.predict(&req).unwrap(),
            h.context.predict(&req).unwrap()
        );
    }

    #[test]
    fn unreadable_audio_fails_before_generation() {
        let dir = TempDir::new().unwrap();
        let h = harness(10);

        let missing = h
            .context
            .predict(&request(&dir.path().join("missing.wav"), "{}"));
        assert!(missing.is_err());

        let broken = dir.path().join("broken.wav");
        std::fs::write(&broken, b"RIFF????WAVEjunk").unwrap();
        assert!(h.context.predict(&request(&broken, "{}")).is_err());

        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.log.lock().unwrap().is_empty());
    }

    #[test]
    fn empty_generation_decodes_to_empty_string() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness(0);

        assert_eq!(h.context.predict(&request(&audio, "{}")).unwrap(), "");
    }

    #[test]
    fn output_shorter_than_prompt_is_an_error() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness_with(5, Contract::DropsPrompt);

        let err = h.context.predict(&request(&audio, "{}")).unwrap_err();
        assert!(err.to_string().contains("for an input of 4"), "{err}");
    }

    #[test]
    fn output_over_budget_is_an_error() {
        let dir = TempDir::new().unwrap();
        let audio = write_tone(dir.path());
        let h = harness_with(5, Contract::IgnoresBudget);

        let err = h
            .context
            .predict(&request(&audio, r#"{"max_tokens":50}"#))
            .unwrap_err();
        assert!(err.to_string().contains("more than the budget of 50"), "{err}");
    }

    #[test]
    fn bundles_must_match_their_slot() {
        let h = harness(1);
        let InferenceContext { mini, small, .. } = h.context;
        assert!(InferenceContext::new(Device::Cpu, DType::BF16, small, mini).is_err());
    }
}
