//! Test doubles shared by unit and integration tests.
//!
//! These are compiled into the library so workspace integration tests can
//! drive the runtime end to end without touching a real backend or the
//! network.

use crate::adapter::{
    CancelToken, Framework, FrameworkAdapter, GenerationRequest, Modality, ModelService,
    RawGeneration, StreamSink,
};
use crate::download::{DownloadTransport, TransportResponse};
use crate::error::{LumenError, LumenResult};
use crate::registry::{ModelFormat, ModelInfo};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ALL_FORMATS: &[ModelFormat] = &[
    ModelFormat::Gguf,
    ModelFormat::MlPackage,
    ModelFormat::Onnx,
    ModelFormat::TfLite,
    ModelFormat::WhisperBundle,
];

const TEXT_ONLY: &[Modality] = &[Modality::Text];

/// Deterministic in-process backend service.
///
/// Responses come from a script queue shared with the adapter that created
/// the service; once the script is exhausted the service echoes the prompt.
/// Output is truncated to `max_tokens` whitespace-separated words, and an
/// optional per-word delay makes timeout behavior testable.
pub struct MockService {
    script: Arc<Mutex<VecDeque<String>>>,
    word_delay: Option<Duration>,
    honor_max_tokens: bool,
}

impl MockService {
    fn next_text(&self, request: &GenerationRequest) -> String {
        let scripted = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front();
        scripted.unwrap_or_else(|| format!("echo: {}", request.prompt))
    }

    fn words<'a>(&self, text: &'a str, max_tokens: u32) -> Vec<&'a str> {
        let limit = if self.honor_max_tokens {
            max_tokens as usize
        } else {
            usize::MAX
        };
        text.split_whitespace().take(limit).collect()
    }
}

impl ModelService for MockService {
    fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> LumenResult<RawGeneration> {
        let text = self.next_text(request);
        let words = self.words(&text, request.max_tokens);
        for _ in &words {
            if cancel.is_cancelled() {
                return Err(LumenError::GenerationFailed("cancelled".into()));
            }
            if let Some(delay) = self.word_delay {
                std::thread::sleep(delay);
            }
        }
        Ok(RawGeneration {
            text: words.join(" "),
            tokens_used: words.len() as u32,
            tokenization_ms: 1,
            inference_ms: 2,
        })
    }

    fn generate_stream(
        &self,
        request: &GenerationRequest,
        sink: StreamSink,
        cancel: &CancelToken,
    ) -> LumenResult<RawGeneration> {
        let text = self.next_text(request);
        let words = self.words(&text, request.max_tokens);
        let mut emitted = Vec::new();
        for (i, word) in words.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LumenError::GenerationFailed("cancelled".into()));
            }
            if let Some(delay) = self.word_delay {
                std::thread::sleep(delay);
            }
            let fragment = if i + 1 == words.len() {
                (*word).to_string()
            } else {
                format!("{} ", word)
            };
            if !sink.emit(fragment) {
                break;
            }
            emitted.push(*word);
        }
        Ok(RawGeneration {
            text: emitted.join(" "),
            tokens_used: emitted.len() as u32,
            tokenization_ms: 1,
            inference_ms: 2,
        })
    }
}

/// Adapter over [`MockService`] for any framework and format.
pub struct MockAdapter {
    framework: Framework,
    memory_estimate: Option<u64>,
    word_delay: Option<Duration>,
    script: Arc<Mutex<VecDeque<String>>>,
    fail_loads: bool,
    honor_max_tokens: bool,
    load_count: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn new(framework: Framework) -> Self {
        Self {
            framework,
            memory_estimate: None,
            word_delay: None,
            script: Arc::new(Mutex::new(VecDeque::new())),
            fail_loads: false,
            honor_max_tokens: true,
            load_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared counter of `load_model` calls, for coalescing assertions.
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.load_count)
    }

    /// Fixed value returned from `estimate_memory_usage`.
    pub fn with_memory_estimate(mut self, bytes: u64) -> Self {
        self.memory_estimate = Some(bytes);
        self
    }

    /// Queue a scripted response; consumed in order, one per generation.
    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.script
            .lock()
            .expect("script lock poisoned")
            .push_back(text.into());
        self
    }

    /// Sleep this long per output word, to exercise timeouts.
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = Some(delay);
        self
    }

    /// Make every `load_model` call fail.
    pub fn with_failing_loads(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    /// Emit the full scripted text regardless of `max_tokens`, modelling a
    /// backend that does not enforce the limit itself.
    pub fn ignoring_max_tokens(mut self) -> Self {
        self.honor_max_tokens = false;
        self
    }

    fn service(&self) -> Arc<dyn ModelService> {
        Arc::new(MockService {
            script: Arc::clone(&self.script),
            word_delay: self.word_delay,
            honor_max_tokens: self.honor_max_tokens,
        })
    }
}

impl FrameworkAdapter for MockAdapter {
    fn framework(&self) -> Framework {
        self.framework
    }

    fn modalities(&self) -> &[Modality] {
        TEXT_ONLY
    }

    fn formats(&self) -> &[ModelFormat] {
        ALL_FORMATS
    }

    fn create_service(&self, _modality: Modality) -> LumenResult<Arc<dyn ModelService>> {
        Ok(self.service())
    }

    fn load_model(
        &self,
        model: &ModelInfo,
        _modality: Modality,
    ) -> LumenResult<Arc<dyn ModelService>> {
        if self.fail_loads {
            return Err(LumenError::LoadingFailed(format!(
                "scripted load failure for {}",
                model.id
            )));
        }
        self.load_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.service())
    }

    fn estimate_memory_usage(&self, model: &ModelInfo) -> u64 {
        self.memory_estimate.unwrap_or(model.estimated_memory)
    }
}

/// Scripted transport: maps exact URLs to canned status/body pairs.
///
/// Unregistered URLs answer 404, which exercises the same tolerance path as
/// a catalog manifest naming files the remote never had. A resumed fetch
/// slices the registered body and answers 206, mirroring range semantics.
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<HashMap<String, (u16, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, url: &str, status: u16, body: &[u8]) {
        self.responses
            .lock()
            .expect("responses lock poisoned")
            .insert(url.to_string(), (status, body.to_vec()));
    }
}

impl DownloadTransport for MockTransport {
    fn fetch(&self, url: &str, range_start: Option<u64>) -> LumenResult<TransportResponse> {
        let entry = self
            .responses
            .lock()
            .expect("responses lock poisoned")
            .get(url)
            .cloned();
        let Some((status, body)) = entry else {
            return Ok(TransportResponse {
                status: 404,
                content_length: None,
                reader: Box::new(io::empty()),
            });
        };
        let (status, body) = match range_start {
            Some(offset) if status == 200 => {
                let offset = (offset as usize).min(body.len());
                (206, body[offset..].to_vec())
            }
            _ => (status, body),
        };
        Ok(TransportResponse {
            status,
            content_length: Some(body.len() as u64),
            reader: Box::new(io::Cursor::new(body)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(max_tokens: u32) -> GenerationRequest {
        GenerationRequest {
            prompt: "one two three four five".into(),
            system_prompt: None,
            max_tokens,
            temperature: 0.7,
            top_p: 1.0,
            top_k: None,
            stop_sequences: Vec::new(),
            seed: None,
            framework_options: Default::default(),
        }
    }

    #[test]
    fn scripted_responses_are_consumed_in_order() {
        let adapter = MockAdapter::new(Framework::LlamaCpp)
            .with_response("first")
            .with_response("second");
        let service = adapter.create_service(Modality::Text).unwrap();
        let cancel = CancelToken::new();

        assert_eq!(service.generate(&request(10), &cancel).unwrap().text, "first");
        assert_eq!(service.generate(&request(10), &cancel).unwrap().text, "second");
        // Exhausted script falls back to echoing.
        assert!(service
            .generate(&request(10), &cancel)
            .unwrap()
            .text
            .starts_with("echo:"));
    }

    #[test]
    fn output_is_capped_at_max_tokens_words() {
        let adapter = MockAdapter::new(Framework::LlamaCpp);
        let service = adapter.create_service(Modality::Text).unwrap();
        let raw = service.generate(&request(3), &CancelToken::new()).unwrap();
        assert_eq!(raw.tokens_used, 3);
    }

    #[test]
    fn unregistered_url_is_a_404() {
        let transport = MockTransport::new();
        let response = transport.fetch("https://nowhere.test/x", None).unwrap();
        assert_eq!(response.status, 404);
    }
}
