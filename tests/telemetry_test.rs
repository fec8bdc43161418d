//! Integration tests for telemetry initialization and span helpers.

use rowq::telemetry::job::{record_state_transition, start_dispatch_span};
use rowq::telemetry::{TelemetryConfig, init_telemetry, metrics};
use rowq::{JobId, Trigger};

#[test]
fn telemetry_initializes_without_endpoint() {
    // A global subscriber can be set once per process; a second attempt
    // from another test is allowed to fail.
    let config = TelemetryConfig {
        service_name: "rowq-test".to_string(),
        ..TelemetryConfig::default()
    };
    if let Ok(guard) = init_telemetry(config) {
        assert!(!guard.is_exporting());
        guard.force_flush();
    }
}

#[test]
fn invalid_log_level_is_a_config_error() {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let config = TelemetryConfig {
        log_level: "rowq=loud".to_string(),
        ..TelemetryConfig::default()
    };
    assert!(matches!(
        init_telemetry(config),
        Err(rowq::Error::Config(_))
    ));
}

#[test]
fn otlp_endpoint_outside_a_runtime_is_an_error() {
    let config = TelemetryConfig {
        endpoint: Some("http://127.0.0.1:4317".to_string()),
        ..TelemetryConfig::default()
    };
    let err = init_telemetry(config).unwrap_err();
    assert!(matches!(err, rowq::Error::Config(ref msg) if msg.contains("tokio runtime")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn otlp_endpoint_inside_a_runtime_does_not_panic() {
    let config = TelemetryConfig {
        endpoint: Some("http://127.0.0.1:4317".to_string()),
        service_name: "rowq-test".to_string(),
        ..TelemetryConfig::default()
    };
    // Another test may already own the global subscriber.
    if let Ok(guard) = init_telemetry(config) {
        assert!(guard.is_exporting());
        tokio::task::spawn_blocking(move || drop(guard))
            .await
            .unwrap();
    }
}

#[test]
fn dispatch_span_records_transition() {
    let span = start_dispatch_span("PingMsg", JobId(7), Trigger::Poll);
    let _entered = span.enter();
    record_state_transition(&span, "active", "completed");
}

#[test]
fn instruments_work_without_a_meter_provider() {
    metrics::jobs_sent().add(1, &[]);
    metrics::job_state_transitions().add(1, &[]);
    metrics::jobs_unroutable().add(1, &[]);
    metrics::dispatch_duration_ms().record(1.5, &[]);
    metrics::poll_batch_size().record(3, &[]);
}
