//! End-to-end runtime tests: load, generate, stream, download, delete.
//!
//! Everything runs against scoped runtimes with mock backends and a mock
//! transport; nothing touches the network or a real inference engine.

use lumen_core::error::LumenError;
use lumen_core::lifecycle::ModelLifecycleState;
use lumen_core::options::{BudgetFallback, GenerationOptions, TokenBudget};
use lumen_core::registry::{ModelFormat, ModelInfo};
use lumen_core::routing::RoutingPolicy;
use lumen_core::testing::{MockAdapter, MockTransport};
use lumen_core::{Framework, LumenRuntime, RuntimeConfig};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn runtime_with(dir: &TempDir, transport: MockTransport) -> Arc<LumenRuntime> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut config = RuntimeConfig::new(dir.path());
    config.routing_policy = RoutingPolicy::PreferDevice;
    Arc::new(LumenRuntime::with_transport(config, Arc::new(transport)).unwrap())
}

fn runtime(dir: &TempDir) -> Arc<LumenRuntime> {
    runtime_with(dir, MockTransport::new())
}

fn phi3() -> ModelInfo {
    ModelInfo::new("phi-3-mini", "Phi 3 Mini", ModelFormat::Gguf, Framework::LlamaCpp)
        .with_estimated_memory(1_000_000)
}

#[tokio::test]
async fn load_and_generate_on_device() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_response("one two three four five six seven eight nine ten eleven twelve");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());

    rt.load_model("phi-3-mini").await.unwrap();
    assert_eq!(
        rt.lifecycle_state("phi-3-mini").await,
        Some(ModelLifecycleState::Ready)
    );

    let result = rt
        .generate("count up", &GenerationOptions::default().with_max_tokens(10))
        .await
        .unwrap();

    assert!(result.executed_on_device());
    assert!(result.tokens_used <= 10);
    assert_eq!(result.framework, Some(Framework::LlamaCpp));
    assert_eq!(result.model_id, "phi-3-mini");
    assert!(result.cost_saved > 0.0);
}

#[tokio::test]
async fn generate_without_a_loaded_model_is_model_not_found() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let err = rt
        .generate("hello", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::ModelNotFound(_)));
}

#[tokio::test]
async fn loading_an_unknown_model_fails() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let err = rt.load_model("nope").await.unwrap_err();
    assert!(matches!(err, LumenError::ModelNotFound(_)));
}

#[tokio::test]
async fn load_without_adapters_reports_framework_not_available() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    rt.register_model(phi3());
    let err = rt.load_model("phi-3-mini").await.unwrap_err();
    assert!(matches!(err, LumenError::FrameworkNotAvailable(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_loads_of_the_same_model_coalesce() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp);
    let loads = adapter.load_counter();
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());

    let a = tokio::spawn({
        let rt = Arc::clone(&rt);
        async move { rt.load_model("phi-3-mini").await }
    });
    let b = tokio::spawn({
        let rt = Arc::clone(&rt);
        async move { rt.load_model("phi-3-mini").await }
    });
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    assert_eq!(loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(rt.current_model().await.as_deref(), Some("phi-3-mini"));
}

#[tokio::test]
async fn unload_makes_the_runtime_modelless_again() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    rt.register_adapter(Arc::new(MockAdapter::new(Framework::LlamaCpp)));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    rt.unload_model().await;
    assert_eq!(rt.current_model().await, None);
    let err = rt
        .generate("hello", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::ModelNotFound(_)));
}

#[tokio::test]
async fn stop_sequences_truncate_blocking_output() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter =
        MockAdapter::new(Framework::LlamaCpp).with_response("keep this ### drop this");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let result = rt
        .generate(
            "go",
            &GenerationOptions::default().with_stop_sequences(vec!["###".into()]),
        )
        .await
        .unwrap();
    assert_eq!(result.text, "keep this ");
    // Words past the stop match were discarded, so they are not billed.
    assert_eq!(result.tokens_used, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_honors_stop_sequences_across_fragments() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp).with_response("alpha beta ### gamma");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let mut stream = rt
        .generate_stream(
            "go",
            &GenerationOptions::default().with_stop_sequences(vec!["###".into()]),
        )
        .await
        .unwrap();

    let mut collected = String::new();
    while let Some(fragment) = stream.next_fragment().await {
        collected.push_str(&fragment);
    }
    assert_eq!(collected, "alpha beta ");

    let result = stream.finish().await.unwrap();
    assert_eq!(result.text, "alpha beta ");
    assert!(!result.text.contains("gamma"));
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_delivers_a_terminal_result() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp).with_response("hello world");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let stream = rt
        .generate_stream("go", &GenerationOptions::default())
        .await
        .unwrap();
    let result = stream.finish().await.unwrap();
    assert_eq!(result.text, "hello world");
    assert_eq!(result.tokens_used, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn streaming_is_capped_when_the_backend_ignores_max_tokens() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .ignoring_max_tokens()
        .with_response("spam ".repeat(200).trim_end().to_string());
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let mut stream = rt
        .generate_stream("go", &GenerationOptions::default().with_max_tokens(5))
        .await
        .unwrap();
    let mut collected = String::new();
    while let Some(fragment) = stream.next_fragment().await {
        collected.push_str(&fragment);
    }
    assert_eq!(collected.split_whitespace().count(), 5);

    let result = stream.finish().await.unwrap();
    assert_eq!(result.tokens_used, 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn generation_holds_the_executing_state_until_completion() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_word_delay(Duration::from_millis(30))
        .with_response("slow and steady words arriving one at a time");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let worker = tokio::spawn({
        let rt = Arc::clone(&rt);
        async move { rt.generate("go", &GenerationOptions::default()).await }
    });
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(
        rt.lifecycle_state("phi-3-mini").await,
        Some(ModelLifecycleState::Executing)
    );

    worker.await.unwrap().unwrap();
    assert_eq!(
        rt.lifecycle_state("phi-3-mini").await,
        Some(ModelLifecycleState::Ready)
    );
}

#[derive(Debug, Deserialize, PartialEq)]
struct Answer {
    answer: u32,
}

#[tokio::test]
async fn structured_generation_retries_until_parse_succeeds() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_response("sure! here is prose, no json")
        .with_response("almost { but broken")
        .with_response("The object: {\"answer\": 4} there.");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let value: Answer = rt
        .generate_structured("what is 2+2", &GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(value, Answer { answer: 4 });
}

#[tokio::test]
async fn structured_generation_gives_up_after_three_attempts() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_response("prose")
        .with_response("prose")
        .with_response("prose")
        .with_response("{\"answer\": 4}");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let err = rt
        .generate_structured::<Answer>("what is 2+2", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::ExtractionFailed(_)));
}

#[tokio::test]
async fn token_budget_truncate_caps_output() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_response("one two three four five six seven eight");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let mut options = GenerationOptions::default().with_max_tokens(50);
    options.token_budget = Some(TokenBudget {
        max_tokens: 3,
        max_cost: None,
        fallback_behavior: BudgetFallback::Truncate,
    });
    let result = rt.generate("go", &options).await.unwrap();
    assert_eq!(result.tokens_used, 3);
}

#[tokio::test]
async fn token_budget_stop_fails_the_request() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    rt.register_adapter(Arc::new(MockAdapter::new(Framework::LlamaCpp)));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let mut options = GenerationOptions::default().with_max_tokens(50);
    options.token_budget = Some(TokenBudget {
        max_tokens: 3,
        max_cost: None,
        fallback_behavior: BudgetFallback::Stop,
    });
    let err = rt.generate("go", &options).await.unwrap_err();
    assert!(matches!(err, LumenError::GenerationFailed(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_backends_are_timed_out_and_cancelled() {
    let dir = TempDir::new().unwrap();
    let mut config = RuntimeConfig::new(dir.path());
    config.routing_policy = RoutingPolicy::PreferDevice;
    config.generation_timeout = Duration::from_millis(50);
    let rt = Arc::new(
        LumenRuntime::with_transport(config, Arc::new(MockTransport::new())).unwrap(),
    );

    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_word_delay(Duration::from_millis(40))
        .with_response("this goes on and on and on and on");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    let err = rt
        .generate("go", &GenerationOptions::default())
        .await
        .unwrap_err();
    match err {
        LumenError::GenerationFailed(detail) => assert!(detail.contains("timed out")),
        other => panic!("expected timeout, got {}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_download_records_the_artifact() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    transport.on("https://models.test/phi-3-mini.gguf", 200, b"weights");
    let rt = runtime_with(&dir, transport);
    rt.register_model(phi3().with_download_url("https://models.test/phi-3-mini.gguf"));

    let task = rt.download_model("phi-3-mini").unwrap();
    let path = task.wait().await.unwrap();

    assert!(path.exists());
    let model = rt
        .list_available_models()
        .into_iter()
        .find(|m| m.id == "phi-3-mini")
        .unwrap();
    assert!(model.is_downloaded());
    assert_eq!(
        rt.lifecycle_state("phi-3-mini").await,
        Some(ModelLifecycleState::Validated)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn single_file_404_fails_and_marks_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    transport.on("https://models.test/phi-3-mini.gguf", 404, b"");
    let rt = runtime_with(&dir, transport);
    rt.register_model(phi3().with_download_url("https://models.test/phi-3-mini.gguf"));

    let task = rt.download_model("phi-3-mini").unwrap();
    let err = task.wait().await.unwrap_err();
    assert!(matches!(err, LumenError::DownloadFailed(_)));
    assert_eq!(
        rt.lifecycle_state("phi-3-mini").await,
        Some(ModelLifecycleState::Error)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn directory_download_tolerates_missing_optional_files() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    // The catalog URL carries the short id; files live under the canonical
    // remote directory.
    let root = "https://models.test/openai_whisper-tiny";
    transport.on(&format!("{}/config.json", root), 200, b"{}");
    transport.on(&format!("{}/model.safetensors", root), 200, b"tensors");
    transport.on(&format!("{}/generation_config.json", root), 200, b"{}");
    transport.on(&format!("{}/preprocessor_config.json", root), 200, b"{}");
    // tokenizer.json is unregistered and answers 404.
    let rt = runtime_with(&dir, transport);
    rt.register_model(
        ModelInfo::new(
            "whisper-tiny",
            "Whisper Tiny",
            ModelFormat::WhisperBundle,
            Framework::WhisperKit,
        )
        .with_download_url("https://models.test/whisper-tiny"),
    );

    let task = rt.download_model("whisper-tiny").unwrap();
    let model_dir = task.wait().await.unwrap();
    assert!(model_dir.join("config.json").exists());
    assert!(!model_dir.join("tokenizer.json").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_model_removes_artifacts_and_clears_the_catalog() {
    let dir = TempDir::new().unwrap();
    let transport = MockTransport::new();
    transport.on("https://models.test/phi-3-mini.gguf", 200, b"weights");
    let rt = runtime_with(&dir, transport);
    rt.register_model(phi3().with_download_url("https://models.test/phi-3-mini.gguf"));

    let path = rt.download_model("phi-3-mini").unwrap().wait().await.unwrap();
    assert!(path.exists());

    rt.delete_model("phi-3-mini").await.unwrap();
    assert!(!path.exists());
    let model = rt
        .list_available_models()
        .into_iter()
        .find(|m| m.id == "phi-3-mini")
        .unwrap();
    assert!(!model.is_downloaded());
}

#[tokio::test]
async fn failed_backend_loads_mark_the_lifecycle() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    rt.register_adapter(Arc::new(
        MockAdapter::new(Framework::LlamaCpp).with_failing_loads(),
    ));
    rt.register_model(phi3());

    let err = rt.load_model("phi-3-mini").await.unwrap_err();
    assert!(matches!(err, LumenError::LoadingFailed(_)));
    assert_eq!(
        rt.lifecycle_state("phi-3-mini").await,
        Some(ModelLifecycleState::Error)
    );
}

#[tokio::test]
async fn thinking_tags_are_stripped_from_output() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    let adapter = MockAdapter::new(Framework::LlamaCpp)
        .with_response("<think> chain of thought </think> the answer is 4");
    rt.register_adapter(Arc::new(adapter));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();
    rt.set_thinking_support("phi-3-mini", Some(("<think>".into(), "</think>".into())))
        .unwrap();

    let result = rt
        .generate("what is 2+2", &GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(result.text, "the answer is 4");
}

#[tokio::test]
async fn generation_analytics_are_grouped_by_session() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    rt.register_adapter(Arc::new(MockAdapter::new(Framework::LlamaCpp)));
    rt.register_model(phi3());
    rt.load_model("phi-3-mini").await.unwrap();

    rt.generate("one", &GenerationOptions::default()).await.unwrap();
    rt.generate("two", &GenerationOptions::default()).await.unwrap();

    let summaries = rt.analytics().summaries();
    let (_, session_type, summary) = summaries
        .iter()
        .find(|(model_id, _, _)| model_id == "phi-3-mini")
        .unwrap();
    assert_eq!(session_type, "text");
    assert_eq!(summary.generation_count, 2);
    assert_eq!(summary.success_count, 2);
    assert!(summary.total_cost_saved > 0.0);
}

#[tokio::test]
async fn lifecycle_observers_see_the_load_transitions() {
    let dir = TempDir::new().unwrap();
    let rt = runtime(&dir);
    rt.register_adapter(Arc::new(MockAdapter::new(Framework::LlamaCpp)));
    rt.register_model(phi3());

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    rt.observe_lifecycle(
        "phi-3-mini",
        Box::new(move |_, _, to| sink.lock().unwrap().push(to)),
    )
    .await;

    rt.load_model("phi-3-mini").await.unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.last(), Some(&ModelLifecycleState::Ready));
    assert!(seen.contains(&ModelLifecycleState::Loading));
}
