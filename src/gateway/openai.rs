//! OpenAI-compatible HTTP gateways.
//!
//! The ports are synchronous and are called from plain threads (the session
//! thread and fallback tier workers), so each adapter drives async `reqwest`
//! through a runtime handle it holds.

use crate::audio::frame::NormalizedAudio;
use crate::audio::wav::{encode_wav, remove_dc_and_normalize};
use crate::config::{ReplyConfig, SynthesisConfig, TranscriptionConfig};
use crate::conversation::history::Message;
use crate::error::{Result, TalkbackError};
use crate::gateway::reply::ReplyGateway;
use crate::gateway::synthesis::SynthesisGateway;
use crate::gateway::transcription::TranscriptionGateway;
use std::time::Duration;
use tokio::runtime::Handle;

/// Peak level audio is scaled to before upload.
const UPLOAD_PEAK: f32 = 0.9;

/// Sample rate of `pcm` responses from the speech endpoint.
const SPEECH_PCM_RATE: u32 = 24000;

fn build_client(timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| TalkbackError::Other(format!("failed to build HTTP client: {e}")))
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn require_key(api_key: &str) -> Result<()> {
    if api_key.trim().is_empty() {
        return Err(TalkbackError::MissingCredential {
            name: crate::defaults::API_KEY_ENV.to_string(),
        });
    }
    Ok(())
}

/// Response from the transcription endpoint
#[derive(serde::Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Speech-to-text over `/audio/transcriptions`.
pub struct OpenAiTranscriber {
    client: reqwest::Client,
    handle: Handle,
    api_key: String,
    url: String,
    model: String,
    prompt: String,
}

impl OpenAiTranscriber {
    pub fn new(config: &TranscriptionConfig, api_key: String, handle: Handle) -> Result<Self> {
        require_key(&api_key)?;
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            handle,
            api_key,
            url: endpoint(&config.endpoint, "audio/transcriptions"),
            model: config.model.clone(),
            prompt: config.prompt.clone(),
        })
    }

    async fn transcribe_async(&self, wav: Vec<u8>, language: String) -> Result<String> {
        tracing::debug!(audio_bytes = wav.len(), "starting transcription request");

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TalkbackError::Transcription {
                message: e.to_string(),
            })?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("response_format", "json");
        if !language.is_empty() {
            form = form.text("language", language);
        }
        if !self.prompt.is_empty() {
            form = form.text("prompt", self.prompt.clone());
        }

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TalkbackError::Transcription {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(TalkbackError::Transcription {
                message: format!("API error {status}: {body}"),
            });
        }

        let result: TranscriptionResponse =
            response
                .json()
                .await
                .map_err(|e| TalkbackError::Transcription {
                    message: format!("invalid response: {e}"),
                })?;
        Ok(result.text.trim().to_string())
    }
}

impl TranscriptionGateway for OpenAiTranscriber {
    fn transcribe(&self, audio: &NormalizedAudio, language: &str) -> Result<String> {
        let prepared = NormalizedAudio::new(
            remove_dc_and_normalize(audio.samples(), UPLOAD_PEAK),
            audio.sample_rate(),
        );
        let wav = encode_wav(&prepared)?;
        self.handle
            .block_on(self.transcribe_async(wav, language.to_string()))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(serde::Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(serde::Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(serde::Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Reply generation over `/chat/completions`.
pub struct OpenAiReplier {
    client: reqwest::Client,
    handle: Handle,
    api_key: String,
    url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiReplier {
    pub fn new(config: &ReplyConfig, api_key: String, handle: Handle) -> Result<Self> {
        require_key(&api_key)?;
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            handle,
            api_key,
            url: endpoint(&config.endpoint, "chat/completions"),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request<'a>(&'a self, system_prompt: &str, history: &[Message]) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::new(
            crate::conversation::history::Role::System,
            system_prompt,
        ));
        messages.extend_from_slice(history);
        ChatRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: 0.9,
            frequency_penalty: 0.1,
            presence_penalty: 0.1,
        }
    }

    async fn generate_async(&self, request: ChatRequest<'_>) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TalkbackError::Reply {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(TalkbackError::Reply {
                message: format!("API error {status}: {body}"),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| TalkbackError::Reply {
            message: format!("invalid response: {e}"),
        })?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default())
    }
}

impl ReplyGateway for OpenAiReplier {
    fn generate(&self, system_prompt: &str, history: &[Message]) -> Result<String> {
        let request = self.request(system_prompt, history);
        self.handle.block_on(self.generate_async(request))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(serde::Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    speed: f32,
    response_format: &'a str,
}

/// Primary voice tier over `/audio/speech`, requesting raw 24 kHz PCM.
pub struct OpenAiSpeech {
    client: reqwest::Client,
    handle: Handle,
    api_key: String,
    url: String,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    pub fn new(config: &SynthesisConfig, api_key: String, handle: Handle) -> Result<Self> {
        require_key(&api_key)?;
        Ok(Self {
            client: build_client(config.primary_timeout_secs)?,
            handle,
            api_key,
            url: endpoint(&config.endpoint, "audio/speech"),
            model: config.model.clone(),
            voice: config.voice.clone(),
        })
    }

    async fn synthesize_async(&self, text: &str, speed: f32) -> Result<Vec<u8>> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: speed.clamp(0.25, 4.0),
            response_format: "pcm",
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| TalkbackError::Synthesis {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TalkbackError::Synthesis {
                message: format!("speech API error {status}: {body}"),
            });
        }

        let bytes = response.bytes().await.map_err(|e| TalkbackError::Synthesis {
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

impl SynthesisGateway for OpenAiSpeech {
    fn name(&self) -> &str {
        "openai-speech"
    }

    fn synthesize(&self, text: &str, speed: f32) -> Result<NormalizedAudio> {
        let pcm = self.handle.block_on(self.synthesize_async(text, speed))?;
        let samples = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
            .collect();
        Ok(NormalizedAudio::new(samples, SPEECH_PCM_RATE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(
            endpoint("https://api.openai.com/v1/", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            endpoint("http://localhost:8080/v1", "audio/speech"),
            "http://localhost:8080/v1/audio/speech"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_key_is_credential_error() {
        let handle = Handle::current();
        let err = OpenAiReplier::new(&ReplyConfig::default(), "  ".to_string(), handle)
            .err()
            .unwrap();
        assert!(matches!(err, TalkbackError::MissingCredential { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chat_request_puts_system_prompt_first() {
        let replier =
            OpenAiReplier::new(&ReplyConfig::default(), "sk-test".to_string(), Handle::current())
                .unwrap();
        let request = replier.request("be brief", &[Message::user("xin chào")]);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "gpt-3.5-turbo");
        assert_eq!(json["max_tokens"], 150);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "be brief");
        assert_eq!(json["messages"][1]["role"], "user");
        assert_eq!(json["messages"][1]["content"], "xin chào");
    }

    #[test]
    fn test_chat_response_without_content_is_empty() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
