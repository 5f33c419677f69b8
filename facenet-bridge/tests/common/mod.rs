//! Shared helpers for tests that drive the stub worker.

#![allow(dead_code)]

use std::time::Duration;

use facenet_bridge::SessionConfig;

/// Session configuration that launches the in-tree stub worker.
pub fn stub_config() -> SessionConfig {
    SessionConfig::for_program(env!("CARGO_BIN_EXE_facenet-stub-worker"))
        .with_quit_grace(Duration::from_secs(2))
}

/// Poll `condition` every few milliseconds for up to five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within 5s");
}
