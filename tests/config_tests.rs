//! Configuration loading: defaults, files, and environment overrides.

use std::io::Write;
use std::time::Duration;

use netpulse::config::Config;
use netpulse::job::QueueStrategy;
use pretty_assertions::assert_eq;
use serial_test::serial;

fn clear_netpulse_env() {
    let keys: Vec<String> = std::env::vars()
        .map(|(k, _)| k)
        .filter(|k| k.starts_with("NETPULSE_"))
        .collect();
    for key in keys {
        std::env::remove_var(key);
    }
}

#[test]
#[serial]
fn defaults_load_without_any_sources() {
    clear_netpulse_env();
    let config = Config::load(None).unwrap();

    assert_eq!(config.server.port, 9000);
    assert_eq!(config.server.api_key, None);
    assert_eq!(config.redis.port, 6379);
    assert_eq!(config.job.ttl, 1800);
    assert_eq!(config.job.timeout, 300);
    assert_eq!(config.job.bulk_timeout, 600);
    assert_eq!(config.worker.scheduler, "least_load");
    assert_eq!(config.worker.node_ttl, Duration::from_secs(60));
}

#[test]
#[serial]
fn environment_overrides_sections() {
    clear_netpulse_env();
    std::env::set_var("NETPULSE_SERVER__PORT", "8123");
    std::env::set_var("NETPULSE_SERVER__API_KEY", "np_live_key");
    std::env::set_var("NETPULSE_REDIS__HOST", "redis.internal");
    std::env::set_var("NETPULSE_WORKER__SCHEDULER", "greedy");
    std::env::set_var("NETPULSE_JOB__TIMEOUT", "120");
    std::env::set_var("NETPULSE_LOG__LEVEL", "debug");

    let config = Config::load(None).unwrap();
    clear_netpulse_env();

    assert_eq!(config.server.port, 8123);
    assert_eq!(config.server.api_key.as_deref(), Some("np_live_key"));
    assert_eq!(config.redis.host, "redis.internal");
    assert_eq!(config.worker.scheduler, "greedy");
    assert_eq!(config.job.timeout, 120);
    assert_eq!(config.log.level, "debug");
}

#[test]
#[serial]
fn explicit_file_loads_and_env_still_wins() {
    clear_netpulse_env();

    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    writeln!(
        file,
        r#"
server:
  port: 7777
worker:
  pinned_per_node: 2
  node_ttl: 45s
drivers:
  queue_strategy:
    ssh: pinned
    sftp: fifo
"#
    )
    .unwrap();

    std::env::set_var("NETPULSE_SERVER__PORT", "7778");
    let config = Config::load(Some(file.path())).unwrap();
    clear_netpulse_env();

    // Env beats file, file beats defaults.
    assert_eq!(config.server.port, 7778);
    assert_eq!(config.worker.pinned_per_node, 2);
    assert_eq!(config.worker.node_ttl, Duration::from_secs(45));
    assert_eq!(
        config.drivers.queue_strategy.get("ssh"),
        Some(&QueueStrategy::Pinned)
    );
    assert_eq!(
        config.drivers.queue_strategy.get("sftp"),
        Some(&QueueStrategy::Fifo)
    );
}

#[test]
#[serial]
fn missing_explicit_file_is_an_error() {
    clear_netpulse_env();
    let result = Config::load(Some(std::path::Path::new("/nonexistent/netpulse.yaml")));
    assert!(result.is_err());
}

#[test]
#[serial]
fn redis_url_reflects_overrides() {
    clear_netpulse_env();
    std::env::set_var("NETPULSE_REDIS__PASSWORD", "hunter2");
    std::env::set_var("NETPULSE_REDIS__TLS", "true");
    std::env::set_var("NETPULSE_REDIS__DB", "3");

    let config = Config::load(None).unwrap();
    clear_netpulse_env();

    assert_eq!(config.redis.url(), "rediss://:hunter2@127.0.0.1:6379/3");
}
