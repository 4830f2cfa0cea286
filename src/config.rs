use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_TEXT_BASE_URL: &str = "https://api.together.xyz/v1";
const DEFAULT_TEXT_MODEL: &str = "meta-llama/Llama-3.3-70B-Instruct-Turbo-Free";
const DEFAULT_IMAGE_MODEL: &str = "fal-ai/fast-turbo-diffusion/image-to-image";
const DEFAULT_IMAGE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct TextSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for TextSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_TEXT_BASE_URL.to_string(),
            model: DEFAULT_TEXT_MODEL.to_string(),
            max_tokens: 4000,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImageSettings {
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
    pub image_size: u32,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_IMAGE_MODEL.to_string(),
            timeout: Duration::from_millis(DEFAULT_IMAGE_TIMEOUT_MS),
            image_size: 512,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VoiceSettings {
    pub agent_id: Option<String>,
    /// Only private agents need this; public agents connect anonymously.
    pub api_key: Option<String>,
}

/// Process-wide configuration, read once at start-up.
///
/// Missing credentials are kept as `None` so the server still boots; the
/// affected session reports `MissingCredentials` on its first call.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub text: TextSettings,
    pub image: ImageSettings,
    pub voice: VoiceSettings,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let text_defaults = TextSettings::default();
        let image_defaults = ImageSettings::default();

        Self {
            text: TextSettings {
                api_key: non_empty_env("TOGETHER_API_KEY"),
                base_url: non_empty_env("TEXT_API_BASE_URL").unwrap_or(text_defaults.base_url),
                model: non_empty_env("TEXT_MODEL").unwrap_or(text_defaults.model),
                max_tokens: parsed_env("TEXT_MAX_TOKENS").unwrap_or(text_defaults.max_tokens),
                temperature: parsed_env("TEXT_TEMPERATURE").unwrap_or(text_defaults.temperature),
            },
            image: ImageSettings {
                api_key: non_empty_env("FAL_KEY"),
                model: non_empty_env("IMAGE_MODEL").unwrap_or(image_defaults.model),
                timeout: parsed_env("IMAGE_TIMEOUT_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(image_defaults.timeout),
                image_size: parsed_env("IMAGE_SIZE").unwrap_or(image_defaults.image_size),
            },
            voice: VoiceSettings {
                agent_id: non_empty_env("VOICE_AGENT_ID"),
                api_key: non_empty_env("ELEVENLABS_API_KEY"),
            },
            port: parsed_env("PORT").unwrap_or(8080),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parsed_env<T: FromStr>(key: &str) -> Option<T> {
    non_empty_env(key).and_then(|v| v.parse().ok())
}
