//! Tracing initialisation.
//!
//! Output always goes to stderr: in a worker process stdout is the reply
//! pipe, and a stray log line there would be read as a frame.

use tracing_subscriber::EnvFilter;

/// Initialize tracing with standard configuration.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing(service_name: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,facenet_bridge=info")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize tracing with JSON output (for production)
pub fn init_tracing_json(service_name: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,facenet_bridge=info")));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .try_init();
}
