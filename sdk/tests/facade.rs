//! Facade tests: initialization gating, idempotence, and delegation.

use lumen_core::registry::{ModelFormat, ModelInfo};
use lumen_core::testing::MockAdapter;
use lumen_core::{Framework, LumenError, RoutingPolicy};
use lumen_sdk::prelude::*;
use std::sync::Arc;
use tempfile::TempDir;

fn facade(dir: &TempDir) -> Lumen {
    let _ = env_logger::builder().is_test(true).try_init();
    Lumen::builder()
        .data_dir(dir.path())
        .routing_policy(RoutingPolicy::PreferDevice)
        .build()
}

fn phi3() -> ModelInfo {
    ModelInfo::new("phi-3-mini", "Phi 3 Mini", ModelFormat::Gguf, Framework::LlamaCpp)
        .with_estimated_memory(1_000_000)
}

#[tokio::test]
async fn calls_before_initialize_are_rejected() {
    let dir = TempDir::new().unwrap();
    let lumen = facade(&dir);
    assert!(!lumen.is_initialized());

    assert!(matches!(
        lumen.list_available_models(),
        Err(LumenError::NotInitialized)
    ));
    assert!(matches!(
        lumen.load_model("phi-3-mini").await,
        Err(LumenError::NotInitialized)
    ));
    assert!(matches!(
        lumen.generate("hi", &GenerationOptions::default()).await,
        Err(LumenError::NotInitialized)
    ));
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let lumen = facade(&dir);

    lumen.initialize().await.unwrap();
    lumen.initialize().await.unwrap();
    assert!(lumen.is_initialized());
    assert!(lumen.list_available_models().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_initializers_share_one_runtime() {
    let dir = TempDir::new().unwrap();
    let lumen = Arc::new(facade(&dir));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lumen = Arc::clone(&lumen);
        handles.push(tokio::spawn(async move { lumen.initialize().await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    lumen.register_model(phi3()).unwrap();
    assert_eq!(lumen.list_available_models().unwrap().len(), 1);
}

#[tokio::test]
async fn generate_flows_through_the_facade() {
    let dir = TempDir::new().unwrap();
    let lumen = facade(&dir);
    lumen.initialize().await.unwrap();

    lumen
        .register_adapter(Arc::new(
            MockAdapter::new(Framework::LlamaCpp).with_response("four"),
        ))
        .unwrap();
    lumen.register_model(phi3()).unwrap();

    let loaded = lumen.load_model("phi-3-mini").await.unwrap();
    assert_eq!(loaded.id, "phi-3-mini");

    let result = lumen
        .generate("What is 2 + 2?", &GenerationOptions::default())
        .await
        .unwrap();
    assert_eq!(result.text, "four");
    assert!(result.executed_on_device());

    lumen.unload_model().await.unwrap();
    let err = lumen
        .generate("again?", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LumenError::ModelNotFound(_)));
}

#[tokio::test]
async fn generation_defaults_survive_a_restart() {
    let dir = TempDir::new().unwrap();

    {
        let lumen = facade(&dir);
        lumen.initialize().await.unwrap();
        let mut defaults = lumen.generation_defaults().unwrap();
        defaults.max_tokens = 42;
        defaults.temperature = 0.3;
        lumen.set_generation_defaults(defaults).unwrap();
    }

    let lumen = facade(&dir);
    lumen.initialize().await.unwrap();
    let defaults = lumen.generation_defaults().unwrap();
    assert_eq!(defaults.max_tokens, 42);
    assert!((defaults.temperature - 0.3).abs() < f32::EPSILON);
}

#[tokio::test]
async fn registered_models_land_in_the_shared_catalog() {
    let dir = TempDir::new().unwrap();
    let lumen = facade(&dir);
    lumen.initialize().await.unwrap();

    lumen.register_model(phi3()).unwrap();

    let reopened = facade(&dir);
    reopened.initialize().await.unwrap();
    let models = reopened.list_available_models().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(models[0].id, "phi-3-mini");
}
