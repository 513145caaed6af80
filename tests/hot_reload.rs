//! Hot reload tests.
//!
//! Policy changes arrive while calls are in flight. Each call keeps the
//! snapshot it started with; invalid sets are rejected whole.

mod common;

use std::time::Duration;

use common::{breaker, engine_with, retry, write_config, MockDependency};
use resilience_runtime::config::loader::load_config;
use resilience_runtime::config::watcher::ConfigWatcher;
use resilience_runtime::config::{ReloadConfig, RetryConfig};
use resilience_runtime::observability::PolicyEventKind;
use resilience_runtime::{ErrorKind, ExecutionContext, Policy, PolicyEngine};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

async fn eventually(mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "condition not met within 10s");
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_call_keeps_its_snapshot() {
    let engine = engine_with(vec![Policy::new("search").with_retry(retry(3))]);
    let dependency = MockDependency::flaky(2);

    let call = {
        let engine = engine.clone();
        let dependency = dependency.clone();
        tokio::spawn(async move {
            engine
                .run("search", ExecutionContext::new(), || dependency.call())
                .await
        })
    };
    while dependency.calls() < 1 {
        tokio::task::yield_now().await;
    }

    // Retries removed mid-call.
    let updated = engine.update_policy("search", Policy::new("search")).unwrap();
    assert_eq!(updated.version, 2);

    let execution = call.await.unwrap();
    assert_eq!(execution.result.unwrap(), "ok");
    assert_eq!(execution.metrics.attempts, 3);

    // New calls see the new bundle.
    let failing = MockDependency::failing();
    let execution = engine
        .run("search", ExecutionContext::new(), || failing.call())
        .await;
    assert_eq!(execution.result.unwrap_err().kind(), ErrorKind::Operation);
    assert_eq!(execution.metrics.attempts, 1);
}

#[tokio::test]
async fn test_breaker_state_survives_policy_update() {
    let engine = engine_with(vec![Policy::new("payments").with_circuit_breaker(breaker(2))]);
    let failing = MockDependency::failing();
    let _ = engine.execute("payments", || failing.call()).await;
    assert_eq!(engine.state("payments").consecutive_failures, 1);

    engine
        .update_policy(
            "payments",
            Policy::new("payments")
                .with_circuit_breaker(breaker(2))
                .with_retry(RetryConfig::default()),
        )
        .unwrap();
    assert_eq!(engine.state("payments").consecutive_failures, 1);
}

#[tokio::test]
async fn test_reloader_applies_valid_sets_only() {
    let engine = engine_with(vec![Policy::new("a")]);
    let mut events = engine.subscribe_events();
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let reloader = engine.spawn_reloader(rx, shutdown.clone());

    let invalid = Policy::new("c").with_retry(RetryConfig {
        max_attempts: 0,
        ..RetryConfig::default()
    });
    tx.send(vec![Policy::new("a"), invalid]).unwrap();
    tx.send(vec![Policy::new("a"), Policy::new("d")]).unwrap();

    eventually(|| engine.get_policy("d").is_ok()).await;
    assert!(engine.get_policy("c").is_err());
    assert_eq!(engine.get_policy("a").unwrap().version, 1);

    let created: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|e| e.kind == PolicyEventKind::PolicyCreated)
        .map(|e| e.subject)
        .collect();
    assert_eq!(created, vec!["d".to_string()]);

    shutdown.cancel();
    reloader.await.unwrap();
}

#[tokio::test]
async fn test_reloader_stops_when_channel_closes() {
    let engine = engine_with(Vec::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let reloader = engine.spawn_reloader(rx, CancellationToken::new());

    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), reloader)
        .await
        .expect("reloader should exit")
        .unwrap();
}

#[tokio::test]
async fn test_file_change_reaches_engine() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        dir.path(),
        "runtime.toml",
        "[[policies]]\nname = \"payments\"\n\n[policies.circuit_breaker]\nfailure_threshold = 3\n",
    );

    let config = load_config(&path).unwrap();
    let engine = std::sync::Arc::new(PolicyEngine::from_config(&config).unwrap());
    assert_eq!(engine.list_policies().len(), 1);

    let (watcher, updates) = ConfigWatcher::new(
        &path,
        ReloadConfig {
            enabled: true,
            poll_interval: Duration::from_millis(100),
        },
    );
    let _handle = watcher.run().unwrap();
    let shutdown = CancellationToken::new();
    let reloader = engine.spawn_reloader(updates, shutdown.clone());

    write_config(
        dir.path(),
        "runtime.toml",
        "[[policies]]\nname = \"payments\"\n\n[policies.circuit_breaker]\nfailure_threshold = 5\n\n\
         [[policies]]\nname = \"search\"\n\n[policies.retry]\nmax_attempts = 2\n",
    );

    eventually(|| {
        engine.get_policy("search").is_ok()
            && engine
                .get_policy("payments")
                .map(|p| p.circuit_breaker.as_ref().map(|cb| cb.failure_threshold) == Some(5))
                .unwrap_or(false)
    })
    .await;

    shutdown.cancel();
    reloader.await.unwrap();
}
