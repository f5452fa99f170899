// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for PostgreSQL.
//!
//! Provides helpers to spin up a PostgreSQL target for integration tests.

use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

const PASSWORD: &str = "sync";

/// Create a vanilla PostgreSQL container.
///
/// Uses the official postgres:16 image. Waits for the second "ready to
/// accept connections" line (the first is the init-script server).
pub fn postgres_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432)
        .with_env_var("POSTGRES_PASSWORD", PASSWORD)
        .with_env_var("POSTGRES_DB", "target")
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_wait_for(WaitFor::seconds(1));
    docker.run(image)
}

/// Get the connection URL for a container.
pub fn postgres_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(5432);
    format!("postgres://postgres:{}@127.0.0.1:{}/target", PASSWORD, port)
}
