// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.

use fanout_engine::config::StoreConfig;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container.
///
/// Uses the official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// Store config pointing at a running container.
pub fn store_config(container: &Container<'_, GenericImage>, key_prefix: Option<&str>) -> StoreConfig {
    StoreConfig {
        host: "127.0.0.1".to_string(),
        port: container.get_host_port_ipv4(6379),
        key_prefix: key_prefix.map(str::to_string),
        connection_timeout: "2s".to_string(),
        ..Default::default()
    }
}
