//! Cross-thread behaviour of the cache and service against the simulated runtime.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;

use llamaserve::cache::CacheDefaults;
use llamaserve::inference::{FinishReason, StreamEvent};
use llamaserve::runtime::{NativeModel, NativeRuntime, SimRuntime, TokenizeOptions};
use llamaserve::service::{CompletionRequest, EmbedRequest, TokenizeRequest};
use llamaserve::store::gguf::empty_header;
use llamaserve::store::ModelStore;
use llamaserve::{CancelSignal, ModelCache, ServeSettings, Service};

const MODELS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

fn models_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    for name in MODELS {
        std::fs::write(dir.path().join(format!("{name}.gguf")), empty_header()).unwrap();
    }
    dir
}

fn service(dir: &TempDir, runtime: Arc<SimRuntime>) -> Arc<Service> {
    let settings = ServeSettings {
        models_directory: dir.path().to_path_buf(),
        ..ServeSettings::default()
    };
    Arc::new(Service::from_settings(runtime, settings))
}

fn echo_runtime() -> SimRuntime {
    SimRuntime::new()
        .with_script(|prompt: &str| format!("re:{prompt}"))
        .with_call_delay(Duration::from_micros(200))
}

#[test]
fn test_concurrent_load_same_path_shares_instance() {
    let dir = models_dir();
    let runtime = Arc::new(SimRuntime::new().with_call_delay(Duration::from_millis(1)));
    let cache = Arc::new(ModelCache::new(
        runtime.clone(),
        ModelStore::new(dir.path()),
        CacheDefaults::default(),
    ));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                cache
                    .load_or_get("alpha", &cache.defaults().model_params)
                    .unwrap()
            })
        })
        .collect();
    let loaded: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(loaded.iter().all(|m| Arc::ptr_eq(m, &loaded[0])));
    assert!(loaded.iter().all(|m| m.loaded_at() == loaded[0].loaded_at()));
    assert_eq!(runtime.load_count(), 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_concurrent_load_distinct_paths() {
    let dir = models_dir();
    let runtime = Arc::new(SimRuntime::new());
    let cache = Arc::new(ModelCache::new(
        runtime.clone(),
        ModelStore::new(dir.path()),
        CacheDefaults::default(),
    ));

    let handles: Vec<_> = MODELS
        .iter()
        .map(|&name| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                let model = cache
                    .load_or_get(name, &cache.defaults().model_params)
                    .unwrap();
                (name, model)
            })
        })
        .collect();

    for handle in handles {
        let (name, model) = handle.join().unwrap();
        assert_eq!(model.model().name, name);
    }
    assert_eq!(runtime.load_count(), MODELS.len());
    assert_eq!(cache.len(), MODELS.len());

    cache.close();
    assert!(cache.is_empty());
}

#[test]
fn test_concurrent_completions_never_overlap_native_calls() {
    let dir = models_dir();
    let runtime = Arc::new(echo_runtime());
    let service = service(&dir, runtime.clone());

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                let request = CompletionRequest {
                    model: "alpha".to_string(),
                    prompt: format!("p{i}"),
                    ..CompletionRequest::default()
                };
                service
                    .complete(&request, &CancelSignal::new(), &mut |_| Ok(()))
                    .unwrap()
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.join().unwrap();
        assert_eq!(response.choices[0].text, format!("re:p{i}"));
        assert_eq!(response.choices[0].finish_reason, FinishReason::Eos);
    }
    assert_eq!(runtime.overlap_count(), 0);
    assert_eq!(runtime.live_contexts(), 0);
    assert_eq!(runtime.load_count(), 1);
}

#[test]
fn test_unlocked_native_calls_are_detected() {
    let dir = models_dir();
    let runtime = SimRuntime::new().with_call_delay(Duration::from_millis(2));
    let native: Arc<dyn NativeModel> = Arc::from(
        runtime
            .load_model(&dir.path().join("alpha.gguf"), &Default::default())
            .unwrap(),
    );
    let start = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let native = Arc::clone(&native);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for _ in 0..25 {
                    native.tokenize("abc", TokenizeOptions::default()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(runtime.overlap_count() > 0);
}

#[test]
fn test_mixed_operations_on_one_model() {
    let dir = models_dir();
    let runtime = Arc::new(echo_runtime());
    let service = service(&dir, runtime.clone());

    let tokenizer = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            for _ in 0..20 {
                let tokens = service
                    .tokenize(&TokenizeRequest {
                        model: "beta".to_string(),
                        text: "abc".to_string(),
                        ..TokenizeRequest::default()
                    })
                    .unwrap()
                    .tokens;
                assert_eq!(tokens.len(), 3);
            }
        })
    };
    let embedder = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            for _ in 0..5 {
                let response = service
                    .embed(&EmbedRequest {
                        model: "beta".to_string(),
                        input: vec!["hello".to_string(), "world".to_string()],
                        ..EmbedRequest::default()
                    })
                    .unwrap();
                assert_eq!(response.embeddings.len(), 2);
            }
        })
    };
    let completer = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            for _ in 0..3 {
                let request = CompletionRequest {
                    model: "beta".to_string(),
                    prompt: "x".to_string(),
                    ..CompletionRequest::default()
                };
                let response = service
                    .complete(&request, &CancelSignal::new(), &mut |_| Ok(()))
                    .unwrap();
                assert_eq!(response.choices[0].text, "re:x");
            }
        })
    };

    tokenizer.join().unwrap();
    embedder.join().unwrap();
    completer.join().unwrap();
    assert_eq!(runtime.overlap_count(), 0);
    assert_eq!(runtime.live_contexts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_streams() {
    let dir = models_dir();
    let runtime = Arc::new(echo_runtime());
    let service = service(&dir, runtime.clone());

    let streams = MODELS.iter().flat_map(|&model| {
        let service = Arc::clone(&service);
        (0..2).map(move |i| {
            let request = CompletionRequest {
                model: model.to_string(),
                prompt: format!("{model}{i}"),
                ..CompletionRequest::default()
            };
            let stream = service.complete_stream(request, CancelSignal::new());
            async move { (format!("{model}{i}"), stream.collect::<Vec<_>>().await) }
        })
    });

    for (prompt, events) in futures::future::join_all(streams).await {
        let text: String = events.iter().filter_map(|e| e.as_text()).collect();
        assert_eq!(text, format!("re:{prompt}"));
        assert!(matches!(events.last(), Some(StreamEvent::Done(_))));
    }
    assert_eq!(runtime.overlap_count(), 0);
    assert_eq!(runtime.load_count(), MODELS.len());
}
