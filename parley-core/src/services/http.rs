//! JSON-over-HTTP clients for the speech, dialogue and synthesis services.
//!
//! | Stage | Request | Response |
//! |-------|---------|----------|
//! | ASR | multipart `file` + `mimeType` | `{ "text" }` |
//! | Dialogue | `{ sessionId, transcript, scenario }` | `{ "response" }` |
//! | Scoring | `{ sessionId, history, scenario }` | `{ score, feedback?, strengths?, improvements? }` |
//! | TTS | `{ text, voiceId }` | `{ audioContent (base64), format }` |
//!
//! Every failure (transport, non-2xx status, malformed body) surfaces as
//! `ParleyError::Network` tagged with the stage.

use std::time::Duration;

use reqwest::multipart;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BoxFuture, DialogueService, SpeechRecognizer, SpeechSynthesizer};
use crate::{
    audio::Recording,
    codec::decode_audio_payload,
    error::{ParleyError, PipelineStage, Result},
    playback::SynthesizedAudio,
    session::{DialogueTurn, ScenarioContext, ScoreReport},
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where each stage lives and how to authenticate.
#[derive(Debug, Clone, Default)]
pub struct ServiceEndpoints {
    pub asr_url: String,
    pub dialogue_url: String,
    pub scoring_url: String,
    pub tts_url: String,
    pub api_key: Option<String>,
}

#[derive(Clone)]
struct HttpClient {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl HttpClient {
    fn new(api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ParleyError::Other(anyhow::anyhow!("http client: {e}")))?;
        Ok(Self { client, api_key })
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.post(url);
        match &self.api_key {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        stage: PipelineStage,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = request
            .send()
            .await
            .map_err(|e| ParleyError::network(stage, e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ParleyError::network(
                stage,
                format!("HTTP {status}: {}", truncate(&body, 200)),
            ));
        }
        resp.json::<T>()
            .await
            .map_err(|e| ParleyError::network(stage, format!("malformed response: {e}")))
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// File extension for a recording MIME type, used as the multipart file name.
fn extension_for(mime_type: &str) -> &'static str {
    let base = mime_type.split(';').next().unwrap_or("").trim();
    match base.to_ascii_lowercase().as_str() {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/mpeg" => "mp3",
        _ => "bin",
    }
}

// ---------------------------------------------------------------------------
// ASR
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: Option<String>,
}

pub struct HttpRecognizer {
    http: HttpClient,
    url: String,
}

impl HttpRecognizer {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(api_key)?,
            url: url.into(),
        })
    }
}

impl SpeechRecognizer for HttpRecognizer {
    fn transcribe<'a>(&'a self, recording: &'a Recording) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let stage = PipelineStage::Transcribe;
            debug!(bytes = recording.len(), mime_type = %recording.mime_type, "sending recording");

            let file_part = multipart::Part::bytes(recording.data.clone())
                .file_name(format!("recording.{}", extension_for(&recording.mime_type)))
                .mime_str(&recording.mime_type)
                .map_err(|e| ParleyError::network(stage, e.to_string()))?;
            let form = multipart::Form::new()
                .part("file", file_part)
                .text("mimeType", recording.mime_type.clone());

            let body: TranscriptionResponse = self
                .http
                .send_json(stage, self.http.post(&self.url).multipart(form))
                .await?;
            Ok(body.text.unwrap_or_default())
        })
    }
}

// ---------------------------------------------------------------------------
// Dialogue + scoring
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RespondRequest<'a> {
    session_id: &'a str,
    transcript: &'a str,
    scenario: &'a ScenarioContext,
}

#[derive(Debug, Deserialize)]
struct RespondResponse {
    response: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ScoreRequest<'a> {
    session_id: &'a str,
    history: &'a [DialogueTurn],
    scenario: &'a ScenarioContext,
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    score: f64,
    #[serde(default)]
    feedback: Option<String>,
    #[serde(default)]
    strengths: Vec<String>,
    #[serde(default)]
    improvements: Vec<String>,
}

impl From<ScoreResponse> for ScoreReport {
    fn from(raw: ScoreResponse) -> Self {
        let mut report = ScoreReport::from_raw(raw.score.round() as i64, raw.feedback);
        report.strengths = raw.strengths;
        report.improvements = raw.improvements;
        report
    }
}

pub struct HttpDialogue {
    http: HttpClient,
    respond_url: String,
    score_url: String,
}

impl HttpDialogue {
    pub fn new(
        respond_url: impl Into<String>,
        score_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(api_key)?,
            respond_url: respond_url.into(),
            score_url: score_url.into(),
        })
    }
}

impl DialogueService for HttpDialogue {
    fn respond<'a>(
        &'a self,
        session_id: &'a str,
        transcript: &'a str,
        scenario: &'a ScenarioContext,
    ) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let request = RespondRequest {
                session_id,
                transcript,
                scenario,
            };
            let body: RespondResponse = self
                .http
                .send_json(
                    PipelineStage::Respond,
                    self.http.post(&self.respond_url).json(&request),
                )
                .await?;
            Ok(body.response)
        })
    }

    fn score<'a>(
        &'a self,
        session_id: &'a str,
        history: &'a [DialogueTurn],
        scenario: &'a ScenarioContext,
    ) -> BoxFuture<'a, Result<ScoreReport>> {
        Box::pin(async move {
            let request = ScoreRequest {
                session_id,
                history,
                scenario,
            };
            let body: ScoreResponse = self
                .http
                .send_json(
                    PipelineStage::Score,
                    self.http.post(&self.score_url).json(&request),
                )
                .await?;
            Ok(body.into())
        })
    }
}

// ---------------------------------------------------------------------------
// TTS
// ---------------------------------------------------------------------------

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    audio_content: String,
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "mp3".to_string()
}

impl SynthesizeResponse {
    fn into_audio(self) -> Result<SynthesizedAudio> {
        let bytes = decode_audio_payload(&self.audio_content)
            .map_err(|e| ParleyError::network(PipelineStage::Synthesize, e.to_string()))?;
        if bytes.is_empty() {
            return Err(ParleyError::network(
                PipelineStage::Synthesize,
                "empty audio payload",
            ));
        }
        Ok(SynthesizedAudio {
            bytes,
            format: self.format,
        })
    }
}

pub struct HttpSynthesizer {
    http: HttpClient,
    url: String,
}

impl HttpSynthesizer {
    pub fn new(url: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            http: HttpClient::new(api_key)?,
            url: url.into(),
        })
    }
}

impl SpeechSynthesizer for HttpSynthesizer {
    fn synthesize<'a>(
        &'a self,
        text: &'a str,
        voice_id: &'a str,
    ) -> BoxFuture<'a, Result<SynthesizedAudio>> {
        Box::pin(async move {
            let request = SynthesizeRequest { text, voice_id };
            let body: SynthesizeResponse = self
                .http
                .send_json(
                    PipelineStage::Synthesize,
                    self.http.post(&self.url).json(&request),
                )
                .await?;
            body.into_audio()
        })
    }
}

/// Build all three clients from one endpoint table.
pub fn clients_from(
    endpoints: &ServiceEndpoints,
) -> Result<(HttpRecognizer, HttpDialogue, HttpSynthesizer)> {
    Ok((
        HttpRecognizer::new(&endpoints.asr_url, endpoints.api_key.clone())?,
        HttpDialogue::new(
            &endpoints.dialogue_url,
            &endpoints.scoring_url,
            endpoints.api_key.clone(),
        )?,
        HttpSynthesizer::new(&endpoints.tts_url, endpoints.api_key.clone())?,
    ))
}
