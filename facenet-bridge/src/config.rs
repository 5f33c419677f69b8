//! Worker session configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::env::IsolatedEnv;

/// Interpreter launched for the Python worker
pub const DEFAULT_PYTHON: &str = "python3";

/// Worker script, relative to the module root
pub const DEFAULT_WORKER_SCRIPT: &str = "python3/facenet_bridge.py";

/// Time `quit()` waits for the worker to exit before killing it (in milliseconds)
pub const DEFAULT_QUIT_GRACE_MS: u64 = 5_000;

/// Largest reply frame accepted from the worker
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// How a worker session launches and talks to its subprocess.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Program to execute. A bare name is resolved inside the isolated
    /// environment when one is configured.
    pub program: PathBuf,

    /// Arguments passed to the program.
    pub args: Vec<String>,

    /// Isolated environment applied to the worker, if any.
    pub environment: Option<IsolatedEnv>,

    /// Extra variables set on the worker process.
    pub envs: Vec<(String, String)>,

    /// Grace period between the quit command and a forced kill.
    pub quit_grace: Duration,

    /// Default timeout for `invoke()`. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,

    /// Largest reply frame accepted from the worker.
    pub max_frame_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PYTHON),
            args: vec![DEFAULT_WORKER_SCRIPT.to_string()],
            environment: None,
            envs: Vec::new(),
            quit_grace: Duration::from_millis(DEFAULT_QUIT_GRACE_MS),
            call_timeout: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SessionConfig {
    /// Python worker installed under `module_root`, with its virtual
    /// environment at `<module_root>/python3`.
    pub fn python(module_root: impl AsRef<Path>) -> Self {
        let module_root = module_root.as_ref();
        Self {
            args: vec![module_root.join(DEFAULT_WORKER_SCRIPT).display().to_string()],
            environment: Some(IsolatedEnv::for_module_root(module_root)),
            ..Self::default()
        }
    }

    /// Any program that speaks the worker protocol, launched without arguments.
    pub fn for_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            ..Self::default()
        }
    }

    /// Python worker configuration read from environment variables.
    ///
    /// - `FACENET_MODULE_ROOT`: module root (default: current directory)
    /// - `FACENET_PYTHON`: interpreter (default: `python3`)
    /// - `FACENET_WORKER_SCRIPT`: worker script (default: `<root>/python3/facenet_bridge.py`)
    /// - `FACENET_QUIT_GRACE_MS`, `FACENET_CALL_TIMEOUT_MS`, `FACENET_MAX_FRAME_BYTES`
    pub fn from_env() -> Self {
        let module_root = std::env::var("FACENET_MODULE_ROOT")
            .map(PathBuf::from)
            .or_else(|_| std::env::current_dir())
            .unwrap_or_else(|_| PathBuf::from("."));

        let mut config = Self::python(&module_root);

        if let Ok(python) = std::env::var("FACENET_PYTHON") {
            config.program = PathBuf::from(python);
        }
        if let Ok(script) = std::env::var("FACENET_WORKER_SCRIPT") {
            config.args = vec![script];
        }

        config.quit_grace = std::env::var("FACENET_QUIT_GRACE_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(config.quit_grace, Duration::from_millis);
        config.call_timeout = std::env::var("FACENET_CALL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis);
        config.max_frame_bytes = std::env::var("FACENET_MAX_FRAME_BYTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        config
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_environment(mut self, environment: IsolatedEnv) -> Self {
        self.environment = Some(environment);
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub const fn with_quit_grace(mut self, grace: Duration) -> Self {
        self.quit_grace = grace;
        self
    }

    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit;
        self
    }
}
