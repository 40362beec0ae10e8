//! Gateway configuration and provider wiring.
//!
//! Precedence: `DIALTONE_*` env > config file (`DIALTONE_CONFIG`, default
//! `config/dialtone`) > plain provider env (`PORT`, `DEEPGRAM_API_KEY`, `GROQ_API_KEY`)
//! > built-in defaults.

use dialtone_voice::{
    CallServices, ChatCompletionsGenerator, DeepgramSpeech, DeepgramTranscription, PlaceholderGenerator,
    PlaceholderTranscription, PlaceholderTts, PlaybackConfig, ReplyConfig, ReplyGenerator, ReplyPipeline,
    SpeechSynthesizer, TranscriptionBackend, TranscriptionConfig, VoiceResult, DEFAULT_CHAT_MODEL,
    DEFAULT_SYSTEM_PROMPT, GROQ_API_BASE, MAX_FRAME_BYTES, TELEPHONY_FRAME_BYTES,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Host advertised in TwiML; defaults to the request's `Host` header
    #[serde(default)]
    pub public_host: Option<String>,

    #[serde(default)]
    pub deepgram_api_key: Option<String>,
    #[serde(default)]
    pub groq_api_key: Option<String>,

    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub system_prompt: String,
    pub generation_timeout_ms: u64,

    pub stt_model: String,
    pub stt_endpointing_ms: u64,
    pub stt_interim_results: bool,

    pub tts_model: String,
    pub synthesis_timeout_ms: u64,

    pub frame_bytes: usize,
    pub playback_lead_ms: u64,
}

impl GatewayConfig {
    /// Load from `.env`-populated environment and the optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path = std::env::var("DIALTONE_CONFIG").unwrap_or_else(|_| "config/dialtone".to_string());

        let mut builder = Self::defaults()?;
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.trim().parse::<i64>() {
                builder = builder.set_default("port", port)?;
            }
        }
        for (key, var) in [("deepgram_api_key", "DEEPGRAM_API_KEY"), ("groq_api_key", "GROQ_API_KEY")] {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_default(key, value)?;
            }
        }

        Self::finish(
            builder
                .add_source(config::File::with_name(&config_path).required(false))
                .add_source(config::Environment::with_prefix("DIALTONE").separator("__")),
        )
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self, config::ConfigError> {
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later, once audio is flowing.
    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.frame_bytes == 0 || self.frame_bytes > MAX_FRAME_BYTES {
            return Err(config::ConfigError::Message(format!(
                "frame_bytes must be between 1 and {}, got {}",
                MAX_FRAME_BYTES, self.frame_bytes
            )));
        }
        Ok(())
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("host", "0.0.0.0")?
            .set_default("port", 5000_i64)?
            .set_default("llm_base_url", GROQ_API_BASE)?
            .set_default("llm_model", DEFAULT_CHAT_MODEL)?
            .set_default("llm_max_tokens", 100_i64)?
            .set_default("llm_temperature", 0.7_f64)?
            .set_default("system_prompt", DEFAULT_SYSTEM_PROMPT)?
            .set_default("generation_timeout_ms", 10_000_i64)?
            .set_default("stt_model", "nova-2")?
            .set_default("stt_endpointing_ms", 300_i64)?
            .set_default("stt_interim_results", true)?
            .set_default("tts_model", "aura-asteria-en")?
            .set_default("synthesis_timeout_ms", 10_000_i64)?
            .set_default("frame_bytes", TELEPHONY_FRAME_BYTES as i64)?
            .set_default("playback_lead_ms", 1_000_i64)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn transcription_config(&self) -> TranscriptionConfig {
        TranscriptionConfig {
            model: self.stt_model.clone(),
            interim_results: self.stt_interim_results,
            endpointing: Duration::from_millis(self.stt_endpointing_ms),
            ..Default::default()
        }
    }

    pub fn reply_config(&self) -> ReplyConfig {
        ReplyConfig {
            system_prompt: self.system_prompt.clone(),
            max_tokens: self.llm_max_tokens,
            generation_timeout: Duration::from_millis(self.generation_timeout_ms),
            synthesis_timeout: Duration::from_millis(self.synthesis_timeout_ms),
            frame_bytes: self.frame_bytes,
            ..Default::default()
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            max_lead: Duration::from_millis(self.playback_lead_ms),
            ..Default::default()
        }
    }

    fn deepgram_key(&self) -> Option<&str> {
        non_empty(self.deepgram_api_key.as_deref())
    }

    fn groq_key(&self) -> Option<&str> {
        non_empty(self.groq_api_key.as_deref())
    }

    /// Build the process-wide provider clients. Missing credentials fall back to
    /// placeholders so the gateway still boots for local testing.
    pub fn build_services(&self) -> VoiceResult<CallServices> {
        let (transcription, synthesizer): (Arc<dyn TranscriptionBackend>, Arc<dyn SpeechSynthesizer>) =
            match self.deepgram_key() {
                Some(key) => (
                    Arc::new(DeepgramTranscription::new(key)),
                    Arc::new(DeepgramSpeech::new(key)?.with_model(&self.tts_model)),
                ),
                None => {
                    warn!("DEEPGRAM_API_KEY not set: calls will connect but nothing is transcribed or spoken");
                    (Arc::new(PlaceholderTranscription), Arc::new(PlaceholderTts))
                }
            };

        let generator: Arc<dyn ReplyGenerator> = match self.groq_key() {
            Some(key) => Arc::new(
                ChatCompletionsGenerator::new(&self.llm_base_url, key)?
                    .with_model(&self.llm_model)
                    .with_temperature(self.llm_temperature),
            ),
            None => {
                warn!("GROQ_API_KEY not set: replies use a fixed placeholder line");
                Arc::new(PlaceholderGenerator::default())
            }
        };

        info!(
            stt_model = %self.stt_model,
            llm_model = %self.llm_model,
            tts_model = %self.tts_model,
            "Voice services ready"
        );

        Ok(CallServices {
            transcription,
            pipeline: ReplyPipeline::new(generator, synthesizer, self.reply_config()),
            transcription_config: self.transcription_config(),
            playback_config: self.playback_config(),
        })
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    fn try_from_toml(toml: &str) -> Result<GatewayConfig, config::ConfigError> {
        GatewayConfig::finish(
            GatewayConfig::defaults()
                .unwrap()
                .add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    fn from_toml(toml: &str) -> GatewayConfig {
        try_from_toml(toml).unwrap()
    }

    #[test]
    fn defaults_match_the_telephony_deployment() {
        let config = from_toml("");
        assert_eq!(config.port, 5000);
        assert_eq!(config.llm_model, "llama3-8b-8192");
        assert_eq!(config.llm_max_tokens, 100);
        assert!(config.system_prompt.contains("Nexus"));
        assert_eq!(config.transcription_config().endpointing, Duration::from_millis(300));
        assert_eq!(config.reply_config().frame_bytes, 160);
        assert_eq!(config.playback_config().max_lead, Duration::from_secs(1));
        assert!(config.deepgram_key().is_none());
    }

    #[test]
    fn file_values_override_defaults() {
        let config = from_toml(
            r#"
            port = 8080
            public_host = "voice.example.com"
            llm_model = "llama-3.1-8b-instant"
            stt_endpointing_ms = 500
            groq_api_key = "  "
            "#,
        );
        assert_eq!(config.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.public_host.as_deref(), Some("voice.example.com"));
        assert_eq!(config.llm_model, "llama-3.1-8b-instant");
        assert_eq!(config.transcription_config().endpointing, Duration::from_millis(500));
        // Blank keys count as missing
        assert!(config.groq_key().is_none());
    }

    #[test]
    fn missing_credentials_fall_back_to_placeholders() {
        let services = from_toml("").build_services().unwrap();
        assert_eq!(services.transcription_config.model, "nova-2");
        assert_eq!(services.pipeline.config().max_tokens, 100);
    }

    #[test]
    fn frame_size_outside_codec_limits_is_rejected() {
        let err = try_from_toml("frame_bytes = 20000").unwrap_err();
        assert!(err.to_string().contains("frame_bytes"));
        assert!(try_from_toml("frame_bytes = 0").is_err());

        let largest = from_toml("frame_bytes = 16000");
        assert_eq!(largest.reply_config().frame_bytes, 16000);
    }
}
