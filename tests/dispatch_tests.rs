//! Dispatcher strategy resolution and submission validation.

use netpulse::config::DriversConfig;
use netpulse::dispatch::{resolve_strategy, CancelOutcome, JobTicket};
use netpulse::driver::DriverRegistry;
use netpulse::job::{JobRequest, JobStatus, QueueStrategy};
use pretty_assertions::assert_eq;
use serde_json::json;

fn registry() -> DriverRegistry {
    DriverRegistry::with_builtins(&["ssh".to_string(), "http".to_string(), "sftp".to_string()])
        .unwrap()
}

fn request(value: serde_json::Value) -> JobRequest {
    serde_json::from_value(value).unwrap()
}

#[test]
fn request_strategy_beats_config_and_capability() {
    let mut config = DriversConfig::default();
    config
        .queue_strategy
        .insert("ssh".to_string(), QueueStrategy::Fifo);

    let req = request(json!({
        "driver": "ssh",
        "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
        "command": "show version",
        "queue_strategy": "pinned",
    }));

    assert_eq!(
        resolve_strategy(&req, &config, &registry()).unwrap(),
        QueueStrategy::Pinned
    );
}

#[test]
fn session_reusing_driver_defaults_to_pinned() {
    let config = DriversConfig::default();
    let req = request(json!({
        "driver": "ssh",
        "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
        "command": "show version",
    }));
    assert_eq!(
        resolve_strategy(&req, &config, &registry()).unwrap(),
        QueueStrategy::Pinned
    );
}

#[test]
fn stateless_drivers_default_to_fifo() {
    let config = DriversConfig::default();
    for driver in ["http", "sftp"] {
        let req = request(json!({
            "driver": driver,
            "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
            "command": "noop",
        }));
        assert_eq!(
            resolve_strategy(&req, &config, &registry()).unwrap(),
            QueueStrategy::Fifo,
            "driver {} should default to fifo",
            driver
        );
    }
}

#[test]
fn config_map_is_authoritative_over_capability() {
    let mut config = DriversConfig::default();
    config
        .queue_strategy
        .insert("http".to_string(), QueueStrategy::Pinned);

    let req = request(json!({
        "driver": "http",
        "connection_args": {"host": "10.0.0.1"},
        "command": "GET /status",
    }));
    assert_eq!(
        resolve_strategy(&req, &config, &registry()).unwrap(),
        QueueStrategy::Pinned
    );
}

#[test]
fn validation_rejects_malformed_requests() {
    // Missing operation entirely.
    let req = request(json!({
        "driver": "ssh",
        "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
    }));
    assert!(req.validate().is_err());

    // Both command and config.
    let req = request(json!({
        "driver": "ssh",
        "connection_args": {"host": "10.0.0.1", "username": "u", "password": "p"},
        "command": "show version",
        "config": ["hostname r1"],
    }));
    assert!(req.validate().is_err());

    // connection_args without a host.
    let req = request(json!({
        "driver": "ssh",
        "connection_args": {"username": "u"},
        "command": "show version",
    }));
    assert!(req.validate().is_err());

    // Empty driver name.
    let req = request(json!({
        "driver": "",
        "connection_args": {"host": "10.0.0.1"},
        "command": "show version",
    }));
    assert!(req.validate().is_err());
}

#[test]
fn ticket_wire_shape_is_stable() {
    let ticket = JobTicket {
        job_id: "7e57".to_string(),
        status: JobStatus::Queued,
        queue: "pinned_10.0.0.1".to_string(),
    };
    let json = serde_json::to_value(&ticket).unwrap();
    assert_eq!(json["job_id"], "7e57");
    assert_eq!(json["status"], "queued");
    assert_eq!(json["queue"], "pinned_10.0.0.1");
}

#[test]
fn cancel_outcomes_serialize_with_tag() {
    assert_eq!(
        serde_json::to_value(CancelOutcome::Cancelled).unwrap(),
        json!({"outcome": "cancelled"})
    );
    assert_eq!(
        serde_json::to_value(CancelOutcome::Requested).unwrap(),
        json!({"outcome": "requested"})
    );
    assert_eq!(
        serde_json::to_value(CancelOutcome::AlreadyTerminal {
            status: JobStatus::Finished
        })
        .unwrap(),
        json!({"outcome": "already_terminal", "status": "finished"})
    );
}
