//! # Speech Endpoints
//!
//! Upload handlers for the single-stage models and the combined pipeline.
//!
//! ## Available Endpoints:
//! - `POST /v1/vad` - speech segments of an upload
//! - `POST /v1/lid` - spoken language of an upload
//! - `POST /v1/asr` - transcript with token timings
//! - `POST /v1/punc` - punctuation restoration for JSON `{"text": ...}`
//! - `POST /v1/process_all` - VAD → LID → ASR → filters → PUNC
//!
//! Audio arrives as multipart form data in a `file` (or `audio`) field. Every
//! endpoint takes optional `uttid` and `force_refresh` query parameters.

use crate::audio::AudioDecodeError;
use crate::error::{AppError, AppResult};
use crate::pipeline::types::to_ms;
use crate::pipeline::{PipelineRequest, PipelineResult, Sentence, StageSet, Word};
use crate::runtime::ModelKind;
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Form fields accepted as the audio upload.
const AUDIO_FIELDS: [&str; 2] = ["file", "audio"];

#[derive(Debug, Default, Deserialize)]
pub struct SpeechQuery {
    pub uttid: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

impl SpeechQuery {
    fn uttid(&self) -> String {
        self.uttid
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}

#[derive(Debug, Deserialize)]
pub struct PuncRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct VadResponse {
    pub uttid: String,
    pub dur_s: f64,
    /// `[start_s, end_s]` pairs
    pub timestamps: Vec<[f64; 2]>,
}

#[derive(Debug, Serialize)]
pub struct LidResponse {
    pub uttid: String,
    pub lang: String,
    pub confidence: f32,
    pub dur_s: f64,
}

#[derive(Debug, Serialize)]
pub struct TokenTiming {
    pub token: String,
    pub start_s: Option<f64>,
    pub end_s: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct AsrResponse {
    pub uttid: String,
    pub text: String,
    pub confidence: Option<f32>,
    pub dur_s: f64,
    pub timestamps: Vec<TokenTiming>,
}

#[derive(Debug, Serialize)]
pub struct PuncResponse {
    pub origin_text: String,
    pub punc_text: String,
}

#[derive(Debug, Serialize)]
pub struct ProcessAllResponse {
    pub uttid: String,
    pub text: String,
    pub sentences: Vec<Sentence>,
    /// `[start_ms, end_ms]` pairs
    pub vad_segments_ms: Vec<[u64; 2]>,
    pub dur_s: f64,
    pub words: Vec<Word>,
}

/// Read the audio field of a multipart upload, enforcing the size cap while streaming.
async fn read_upload(mut payload: Multipart, limit: usize) -> AppResult<Vec<u8>> {
    while let Some(item) = payload.next().await {
        let mut field: Field = item?;

        let is_audio = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .is_some_and(|name| AUDIO_FIELDS.contains(&name));
        if !is_audio {
            while let Some(chunk) = field.next().await {
                chunk?;
            }
            continue;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let chunk = chunk?;
            if bytes.len() + chunk.len() > limit {
                let size = bytes.len() + chunk.len();
                return Err(AudioDecodeError::TooLarge { size, limit }.into());
            }
            bytes.extend_from_slice(&chunk);
        }
        debug!(bytes = bytes.len(), "Received audio upload");
        return Ok(bytes);
    }

    Err(AppError::BadRequest("No audio file provided (expected form field 'file')".to_string()))
}

/// Decode the upload and run it through `stages`.
async fn run_upload(
    state: &AppState,
    query: &SpeechQuery,
    payload: Multipart,
    stages: StageSet,
) -> AppResult<PipelineResult> {
    let bytes = read_upload(payload, state.normalizer.max_upload_bytes()).await?;
    let clip = state.normalizer.normalize(&bytes)?;
    let request = PipelineRequest::audio(query.uttid(), clip, stages)
        .with_force_refresh(query.force_refresh);
    Ok(state.orchestrator.run(request).await?)
}

/// ## Endpoint: `POST /v1/vad`
pub async fn vad(
    state: web::Data<AppState>,
    query: web::Query<SpeechQuery>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let result = run_upload(&state, &query, payload, StageSet::only(ModelKind::Vad)).await?;
    let timestamps = result
        .segments
        .unwrap_or_default()
        .iter()
        .map(|segment| [segment.start_s, segment.end_s])
        .collect();

    Ok(HttpResponse::Ok().json(VadResponse {
        uttid: result.uttid,
        dur_s: result.duration_s,
        timestamps,
    }))
}

/// ## Endpoint: `POST /v1/lid`
pub async fn lid(
    state: web::Data<AppState>,
    query: web::Query<SpeechQuery>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let result = run_upload(&state, &query, payload, StageSet::only(ModelKind::Lid)).await?;
    let language = result.language.ok_or_else(|| {
        AppError::Internal("language identification produced no result".to_string())
    })?;

    Ok(HttpResponse::Ok().json(LidResponse {
        uttid: result.uttid,
        lang: language.lang,
        confidence: language.confidence,
        dur_s: result.duration_s,
    }))
}

/// ## Endpoint: `POST /v1/asr`
///
/// Repeat and low-information filters apply; the script filter needs a
/// language and is skipped here.
pub async fn asr(
    state: web::Data<AppState>,
    query: web::Query<SpeechQuery>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let result = run_upload(&state, &query, payload, StageSet::only(ModelKind::Asr)).await?;
    let transcript = result.transcript.unwrap_or_default();

    Ok(HttpResponse::Ok().json(AsrResponse {
        uttid: result.uttid,
        text: transcript.text,
        confidence: transcript.confidence,
        dur_s: result.duration_s,
        timestamps: transcript
            .tokens
            .into_iter()
            .map(|token| TokenTiming {
                token: token.text,
                start_s: token.start_s,
                end_s: token.end_s,
            })
            .collect(),
    }))
}

/// ## Endpoint: `POST /v1/punc`
///
/// ## Request Body:
/// ```json
/// { "text": "how are you" }
/// ```
pub async fn punc(
    state: web::Data<AppState>,
    query: web::Query<SpeechQuery>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    let request: PuncRequest = serde_json::from_slice(&body)?;
    let pipeline = PipelineRequest::text(query.uttid(), request.text.clone())
        .with_force_refresh(query.force_refresh);
    let result = state.orchestrator.run(pipeline).await?;

    Ok(HttpResponse::Ok().json(PuncResponse {
        origin_text: request.text,
        punc_text: result.punctuated.unwrap_or_default(),
    }))
}

/// ## Endpoint: `POST /v1/process_all`
///
/// ## Response:
/// ```json
/// {
///   "uttid": "a1b2",
///   "text": "Hello world.",
///   "sentences": [{"start_ms": 500, "end_ms": 1500, "text": "Hello world.",
///                  "asr_confidence": 0.87, "lang": "en", "lang_confidence": 0.93}],
///   "vad_segments_ms": [[500, 1500]],
///   "dur_s": 2.0,
///   "words": [{"start_ms": 500, "end_ms": 900, "text": "hello"}]
/// }
/// ```
pub async fn process_all(
    state: web::Data<AppState>,
    query: web::Query<SpeechQuery>,
    payload: Multipart,
) -> AppResult<HttpResponse> {
    let result = run_upload(&state, &query, payload, StageSet::all()).await?;
    let vad_segments_ms = result
        .segments
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|segment| [to_ms(segment.start_s), to_ms(segment.end_s)])
        .collect();

    Ok(HttpResponse::Ok().json(ProcessAllResponse {
        uttid: result.uttid,
        text: result.punctuated.unwrap_or_default(),
        sentences: result.sentences,
        vad_segments_ms,
        dur_s: result.duration_s,
        words: result.words,
    }))
}
