//! Speech synthesis against the Gemini `generateContent` API
//!
//! Long text is split at sentence boundaries into chunks the model accepts.
//! Each chunk is one queued call; the provider returns raw 16-bit PCM
//! (`audio/L16;rate=24000`), which is concatenated and wrapped in a WAV
//! header so browsers can play it directly.

use base64::Engine;
use key_pool::Credential;
use request_queue::{Attempt, AttemptError, RequestQueue};
use serde::Deserialize;
use tracing::{debug, info, instrument};

use crate::error::{Error, Result};
use crate::metrics;

/// Longest chunk sent in a single provider call.
pub const MAX_CHUNK_CHARS: usize = 5000;

const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Error bodies are truncated to this many characters in logs and errors.
const ERROR_BODY_CHARS: usize = 300;

const READ_ALOUD_PREFIX: &str =
    "Read the following text aloud exactly as written, do not respond or add anything:";

const SYSTEM_INSTRUCTION: &str = "You are a text-to-speech engine. Your ONLY job is to read the \
provided text aloud exactly as written. Do NOT respond to the text, do NOT generate any new \
text, do NOT answer questions. Just convert the text to speech audio.";

/// Audio returned by one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

/// HTTP client for the provider's text-to-speech model.
#[derive(Clone)]
pub struct GeminiTts {
    client: reqwest::Client,
    base_url: String,
    model: String,
    voice: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    data: String,
}

impl GeminiTts {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            voice: voice.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "contents": [{
                "parts": [{
                    "text": format!("{READ_ALOUD_PREFIX}\n\n{text}"),
                }],
            }],
            "systemInstruction": {
                "parts": [{ "text": SYSTEM_INSTRUCTION }],
            },
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": self.voice },
                    },
                },
            },
        })
    }

    /// One synthesis attempt with the given key.
    ///
    /// The key travels in the `x-goog-api-key` header so it never appears in
    /// a URL that might be logged.
    pub async fn synthesize(
        &self,
        credential: Credential,
        text: &str,
    ) -> std::result::Result<Attempt<SpeechAudio>, AttemptError> {
        let request = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", credential.expose())
            .json(&self.request_body(text));
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(AttemptError::from_reqwest(e, Some(credential))),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.chars().take(ERROR_BODY_CHARS).collect();
            return Err(AttemptError::status(status.as_u16(), credential, message));
        }

        let parsed: GenerateResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(e) => return Err(AttemptError::from_reqwest(e, Some(credential))),
        };

        let Some(inline) = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .and_then(|content| {
                content.parts.into_iter().find_map(|part| {
                    part.inline_data
                        .filter(|data| data.mime_type.starts_with("audio/"))
                })
            })
        else {
            return Err(AttemptError::invalid_response(
                credential,
                "no audio part in response",
            ));
        };

        let bytes = match base64::engine::general_purpose::STANDARD.decode(inline.data) {
            Ok(bytes) => bytes,
            Err(e) => {
                return Err(AttemptError::invalid_response(
                    credential,
                    format!("audio payload is not valid base64: {e}"),
                ));
            }
        };

        debug!(
            key = %credential.label(),
            mime_type = %inline.mime_type,
            size = bytes.len(),
            "received audio"
        );
        Ok(Attempt::new(
            SpeechAudio {
                bytes,
                mime_type: inline.mime_type,
            },
            credential,
        )
        .with_status(status.as_u16()))
    }
}

/// Synthesize `text` through the queue and return WAV bytes.
#[instrument(skip_all, fields(chars = text.chars().count()))]
pub async fn generate_wav(queue: &RequestQueue, tts: &GeminiTts, text: &str) -> Result<Vec<u8>> {
    let chunks = chunk_text(text, MAX_CHUNK_CHARS);
    info!(chunks = chunks.len(), "generating audio");

    let mut pcm = Vec::new();
    let mut first_mime: Option<String> = None;

    for chunk in &chunks {
        let audio = synthesize_chunk(queue, tts, chunk).await?;
        let first = first_mime.get_or_insert_with(|| audio.mime_type.clone());
        if *first != audio.mime_type {
            return Err(Error::UnsupportedAudio(format!(
                "chunks returned mixed formats: {first} and {}",
                audio.mime_type
            )));
        }
        pcm.extend_from_slice(&audio.bytes);
    }

    let mime = first_mime.unwrap_or_default();
    if is_pcm(&mime) {
        let sample_rate = sample_rate(&mime).unwrap_or(DEFAULT_SAMPLE_RATE);
        debug!(sample_rate, "wrapping PCM in WAV container");
        Ok(pcm_to_wav(&pcm, sample_rate, 1, 16))
    } else if mime == "audio/wav" && chunks.len() == 1 {
        Ok(pcm)
    } else {
        Err(Error::UnsupportedAudio(mime))
    }
}

async fn synthesize_chunk(
    queue: &RequestQueue,
    tts: &GeminiTts,
    chunk: &str,
) -> Result<SpeechAudio> {
    let audio = queue
        .submit("tts", |ctx| async move {
            let credential = ctx.select_key().await;
            tts.synthesize(credential, chunk)
                .await
                .inspect_err(|e| metrics::record_attempt_failure(e.kind.label()))
        })
        .await?;
    Ok(audio)
}

fn is_pcm(mime: &str) -> bool {
    mime.contains("L16") || mime.contains("pcm")
}

/// Sample rate from a mime parameter such as `audio/L16;codec=pcm;rate=24000`.
fn sample_rate(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Wrap raw little-endian PCM in a 44-byte RIFF/WAVE header.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Vec<u8> {
    let data_len = pcm.len() as u32;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate * u32::from(block_align);

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

/// Split text at sentence ends (`.`, `!`, `?` followed by whitespace) and
/// pack sentences into chunks of at most `max_chars` characters. A single
/// sentence longer than `max_chars` becomes its own chunk.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_chars = 0usize;

    for sentence in split_sentences(text) {
        let sentence_chars = sentence.chars().count();
        if current_chars > 0 && current_chars + 1 + sentence_chars > max_chars {
            chunks.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        if current_chars > 0 {
            current.push(' ');
            current_chars += 1;
        }
        current.push_str(sentence);
        current_chars += sentence_chars;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut after_terminal = false;

    for (idx, c) in text.char_indices() {
        if c.is_whitespace() && after_terminal {
            sentences.push(&text[start..idx]);
            start = idx;
        }
        after_terminal = matches!(c, '.' | '!' | '?');
    }
    sentences.push(&text[start..]);

    sentences
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
