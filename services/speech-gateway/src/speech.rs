//! `POST /v1/speech`: cached text-to-speech
//!
//! 1. Validate text and language
//! 2. Look the (text, language) pair up in the artifact cache
//! 3. On a miss, synthesize through the request queue
//! 4. Store the WAV and answer with its public URL

use std::sync::Arc;

use artifact_cache::{ArtifactCache, ArtifactContext, CacheKey, StoreRequest};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use request_queue::RequestQueue;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::error::Error;
use crate::metrics;
use crate::synth::{self, GeminiTts};

/// Shared state for the speech handler
#[derive(Clone)]
pub struct SpeechState {
    pub queue: Arc<RequestQueue>,
    pub cache: Arc<ArtifactCache>,
    pub tts: GeminiTts,
}

#[derive(Debug, Deserialize)]
pub struct SpeechRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, alias = "pageId")]
    pub page_id: Option<String>,
    #[serde(default, alias = "pageTitle")]
    pub page_title: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeechResponse {
    pub url: String,
    pub hash: String,
    pub language: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Serve one speech request. Never fails: every outcome is an HTTP response.
#[instrument(skip_all, fields(request_id = %request_id, language = %request.language))]
pub async fn synthesize_speech(
    state: &SpeechState,
    request: SpeechRequest,
    request_id: String,
) -> Response {
    if request.text.trim().is_empty() || request.language.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "text and language are required",
            &request_id,
        );
    }

    let key = CacheKey::new(&request.text, &request.language);

    if let Some(hit) = state.cache.lookup(&key).await {
        metrics::record_cache_lookup(true);
        info!(hash = %hit.content_hash, "cache hit");
        return speech_response(hit);
    }
    metrics::record_cache_lookup(false);
    info!(hash = %key.hash, "cache miss, generating audio");

    let wav = match synth::generate_wav(&state.queue, &state.tts, &request.text).await {
        Ok(wav) => wav,
        Err(e) => {
            warn!(error = %e, "speech synthesis failed");
            return failure_response(&e, &request_id);
        }
    };

    let stored = state
        .cache
        .store(StoreRequest {
            content: request.text,
            variant: request.language,
            bytes: wav,
            context: ArtifactContext {
                page_id: request.page_id,
                page_title: request.page_title,
                section: request.section,
            },
        })
        .await;

    match stored {
        Ok(artifact) => speech_response(artifact),
        Err(e) => {
            let e = Error::from(e);
            error!(error = %e, "failed to store audio");
            failure_response(&e, &request_id)
        }
    }
}

fn speech_response(artifact: artifact_cache::CachedArtifact) -> Response {
    Json(SpeechResponse {
        url: artifact.url,
        hash: artifact.content_hash,
        language: artifact.variant,
        cached: artifact.cached,
        size: artifact.byte_size,
    })
    .into_response()
}

fn failure_response(err: &Error, request_id: &str) -> Response {
    let (status, error_type) = match err {
        Error::Upstream(_) | Error::UnsupportedAudio(_) => {
            (StatusCode::BAD_GATEWAY, "upstream_error")
        }
        Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
    };
    error_response(status, error_type, &err.to_string(), request_id)
}
