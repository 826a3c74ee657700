//! End-to-end engine tests: configuration → runtime → invoker → dispatcher

use std::sync::Arc;
use std::time::Duration;

use nimbus_core::backend::{self, BackendClient, IbmCfClient};
use nimbus_core::config::{BackendKind, IbmCfConfig};
use nimbus_core::prelude::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn ibm_cf_config(endpoint: &str) -> Config {
    let mut config = Config::from_json_str(
        r#"{
            "nimbus": {
                "backend": "ibm_cf",
                "runtime_memory": 512,
                "retries": 3,
                "retry_sleeps": [1],
                "poll_interval_ms": 10
            }
        }"#,
    )
    .unwrap();
    config.ibm_cf = Some(IbmCfConfig {
        endpoint: Some(endpoint.to_string()),
        namespace: Some("team".to_string()),
        api_key: Some("user:secret".to_string()),
    });
    config
}

fn payload(call: usize) -> CallPayload {
    CallPayload {
        executor_id: ExecutorId::new("engine-M000"),
        call_id: CallId::new(call),
        function: "work".to_string(),
        args: json!(call),
        initializer: None,
        runtime_memory: 512,
    }
}

#[test]
fn test_resolve_default_runtime_for_namespace() {
    let config = ibm_cf_config("https://cf.test");
    let descriptor = RuntimeResolver::new("0.2").resolve(&config).unwrap();

    assert_eq!(descriptor.runtime, "team/nimbus-kn-runtime-v02");
    assert_eq!(
        descriptor.image_reference,
        "docker.io/team/nimbus-kn-runtime-v02:latest"
    );
    assert_eq!(descriptor.memory_mb, 512);
    assert_eq!(descriptor.action_name(), "team_nimbus-kn-runtime-v02_512MB");
}

#[test_log::test(tokio::test)]
async fn test_throttled_twice_then_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(r"^/api/v1/namespaces/team/actions/nimbus_v[^/]+/team_nimbus-kn-runtime-v02_512MB$"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"activationId": "id-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let config = ibm_cf_config(&server.uri());
    let descriptor = RuntimeResolver::new("0.2").resolve(&config).unwrap();
    // Keep the mock server's plain http endpoint.
    let client = IbmCfClient::new(server.uri(), "team", "user:secret").unwrap();
    let invoker = Invoker::from_config(Arc::new(client), &config.nimbus)
        .with_invoke_timeout(Some(Duration::from_secs(30)));

    let invocation = invoker
        .invoke(&payload(0), &descriptor, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(invocation.id, InvocationId::new("id-42"));
    assert_eq!(invocation.attempts, 3);
}

#[tokio::test]
async fn test_unauthorized_fails_every_call_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(4)
        .mount(&server)
        .await;

    let config = ibm_cf_config(&server.uri());
    let descriptor = Arc::new(RuntimeResolver::new("0.2").resolve(&config).unwrap());
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
    let client = IbmCfClient::new(server.uri(), "team", "user:secret").unwrap();
    let invoker = Arc::new(Invoker::from_config(Arc::new(client), &config.nimbus));
    let dispatcher = JobDispatcher::new(
        invoker,
        store,
        DispatcherConfig::from_config(&config, &descriptor),
    );

    let calls = (0..4).map(|i| CallSpec::new("work", json!(i))).collect();
    let job = dispatcher
        .submit(ExecutorId::new("engine-M000"), descriptor, calls, None)
        .unwrap();
    let results = dispatcher.collect(job, Some(Duration::from_secs(5))).await;

    assert_eq!(results.len(), 4);
    for (_, result) in results.iter() {
        assert_eq!(result.status, CallStatus::Failed);
        let error = result.outcome.as_ref().unwrap_err();
        assert_eq!(error.kind, CallErrorKind::FatalInvocation);
        assert_eq!(error.details, Some(json!({"attempts": 1})));
    }
}

#[tokio::test]
async fn test_accepted_calls_resolve_from_store() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({"activationId": "act"})))
        .mount(&server)
        .await;

    let config = ibm_cf_config(&server.uri());
    let descriptor = Arc::new(RuntimeResolver::new("0.2").resolve(&config).unwrap());
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
    let client = IbmCfClient::new(server.uri(), "team", "user:secret").unwrap();
    let invoker = Arc::new(Invoker::from_config(Arc::new(client), &config.nimbus));
    let dispatcher = JobDispatcher::new(
        invoker,
        store.clone(),
        DispatcherConfig::from_config(&config, &descriptor),
    );

    // A remote worker records outcomes shortly after acceptance.
    let executor_id = ExecutorId::new("engine-M001");
    let writer = {
        let store = store.clone();
        let executor_id = executor_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store
                .put(&executor_id, CallId::new(0), StoredOutcome::Success { value: json!("ok") })
                .await
                .unwrap();
            store
                .put(
                    &executor_id,
                    CallId::new(1),
                    StoredOutcome::Error {
                        error: CallError::function("boom"),
                    },
                )
                .await
                .unwrap();
        })
    };

    let calls = vec![CallSpec::new("work", json!(0)), CallSpec::new("work", json!(1))];
    let job = dispatcher
        .submit(executor_id, descriptor, calls, None)
        .unwrap();
    let results = dispatcher.collect(job, Some(Duration::from_secs(5))).await;
    writer.await.unwrap();

    let ordered = results.into_ordered();
    assert_eq!(ordered[0].outcome, Ok(json!("ok")));
    assert_eq!(ordered[0].invocation_id, Some(InvocationId::new("act")));
    assert_eq!(ordered[1].status, CallStatus::Failed);
}

#[tokio::test]
async fn test_localhost_round_trip_with_initializer() {
    let mut registry = FunctionRegistry::new();
    let init = registry
        .register_initializer("seed", |globals: &mut Globals, offset: i64| {
            globals.set("offset", offset)
        })
        .unwrap();
    registry
        .register_function("add_offset", |globals: &Globals, n: i64| {
            Ok::<_, CallError>(n + globals.get::<i64>("offset")?)
        })
        .unwrap();

    let mut config = Config::localhost();
    config.nimbus.poll_interval_ms = 5;
    let store: Arc<dyn ResultStore> = Arc::new(InMemoryResultStore::new());
    let backend = backend::connect(&config, store.clone(), Arc::new(registry)).unwrap();
    assert_eq!(backend.name(), "localhost");

    let descriptor = Arc::new(RuntimeResolver::for_host().resolve(&config).unwrap());
    let invoker = Arc::new(Invoker::from_config(backend, &config.nimbus));
    let dispatcher = JobDispatcher::new(
        invoker,
        store,
        DispatcherConfig::from_config(&config, &descriptor),
    );

    let context = PoolWorkerContext::new(&init, 100).unwrap();
    let calls = (0..5).map(|i| CallSpec::new("add_offset", json!(i))).collect();
    let job = dispatcher
        .submit(ExecutorId::new("local-M000"), descriptor, calls, Some(&context))
        .unwrap();
    let results = dispatcher.collect(job, None).await;

    let values: Vec<_> = results
        .into_ordered()
        .into_iter()
        .map(|r| r.into_outcome().unwrap())
        .collect();
    assert_eq!(values, vec![json!(100), json!(101), json!(102), json!(103), json!(104)]);
}

#[test]
fn test_knative_has_no_bundled_client() {
    let mut config = Config::new(BackendKind::Knative);
    config.knative = Some(nimbus_core::config::KnativeConfig {
        docker_user: Some("alice".to_string()),
        docker_token: Some("token".to_string()),
        ..Default::default()
    });

    // Resolution works; only the client is missing.
    let descriptor = RuntimeResolver::new("0.2").resolve(&config).unwrap();
    assert_eq!(descriptor.runtime, "alice/nimbus-kn-runtime-v02");

    let err = backend::connect(
        &config,
        Arc::new(InMemoryResultStore::new()),
        Arc::new(FunctionRegistry::new()),
    )
    .err()
    .unwrap();
    assert!(matches!(err, ConfigError::UnsupportedBackend(BackendKind::Knative)));
}
