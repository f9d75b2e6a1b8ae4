//! Helper functions for integration tests

use std::sync::Arc;

use chrono::Utc;
use fleet_state::clock::ManualClock;
use fleet_state::config::{AgentConfig, Config, RetryConfig, StoreConfig};
use fleet_state::store::{MachineInfo, MetricSnapshot, ResourceStore};

pub fn machine_info(host: &str) -> MachineInfo {
    MachineInfo {
        hostname: Some(host.to_string()),
        os_name: Some("TestOS".to_string()),
        arch: "x86_64".to_string(),
        cpu_count: 8,
        memory_total: 16_000_000_000,
        ..MachineInfo::default()
    }
}

/// A snapshot whose numeric fields all carry `marker`, so a torn read shows up as a mismatch
pub fn marked_snapshot(marker: u64) -> MetricSnapshot {
    MetricSnapshot {
        timestamp: Utc::now(),
        cpu_avg: marker as f32,
        memory_used: marker,
        memory_total: marker,
        swap_used: marker,
        temp_avg: None,
        cpus: vec![],
        components: vec![],
    }
}

pub fn create_store(config: StoreConfig) -> (Arc<ResourceStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let store = ResourceStore::new(&config, clock.clone()).unwrap();
    (Arc::new(store), clock)
}

/// Config with millisecond backoff so HTTP tests stay fast
pub fn fast_retry_config() -> Config {
    Config {
        retry: RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 50,
            ..RetryConfig::default()
        },
        ..Config::default()
    }
}

pub fn create_agent_config(id: &str, server_uri: &str) -> AgentConfig {
    let url = url::Url::parse(server_uri).unwrap();
    AgentConfig {
        id: Some(id.to_string()),
        ip: url.host_str().unwrap().parse().unwrap(),
        port: url.port().unwrap(),
        interval: 3600,
        token: Some("test-token".to_string()),
    }
}

pub fn create_mock_report_json(cpu_usage: f32, temperature: Option<f32>) -> serde_json::Value {
    serde_json::json!({
        "system": {
            "name": "TestOS",
            "kernel_version": "5.0.0",
            "os_version": "Test 1.0",
            "host_name": "test-host"
        },
        "memory": {
            "total": 16000000000u64,
            "used": 8000000000u64,
            "total_swap": 4000000000u64,
            "used_swap": 1000000000u64
        },
        "cpus": {
            "total": 8,
            "arch": "x86_64",
            "average_usage": cpu_usage,
            "cpus": []
        },
        "components": {
            "average_temperature": temperature,
            "components": []
        }
    })
}
