//! FaceNet Bridge - Python worker bridge for face detection and embedding
//!
//! This crate runs MTCNN face detection and FaceNet embedding in a Python
//! subprocess and exposes them as typed async operations.
//!
//! # Architecture
//!
//! - [`env`]: provisions the isolated virtual environment the worker runs in
//! - [`workers`]: owns the worker subprocess and serialises calls over its pipe
//! - [`codec`]: JSON Lines frames and base64 pixel buffers
//! - [`facenet`]: the typed face operations
//!
//! Each [`WorkerSession`] owns exactly one subprocess. Calls on one session
//! are answered strictly in order; use several sessions for parallel work.
//!
//! # Example
//!
//! ```ignore
//! use facenet_bridge::{ImageTensor, PythonFacenet, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let facenet = PythonFacenet::start(SessionConfig::from_env()).await?;
//!     facenet.init_mtcnn().await?;
//!
//!     let image = ImageTensor::new(480, 640, 3, load_rgb_pixels())?;
//!     let alignment = facenet.align(&image).await?;
//!     println!("faces: {}", alignment.len());
//!
//!     facenet.quit().await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod env;
pub mod error;
pub mod facenet;
pub mod telemetry;
pub mod workers;

// Re-export main types for convenience
pub use codec::{BridgeArg, BridgeCall, BridgeReply, CodecError, EncodedBuffer, ImageTensor};
pub use config::SessionConfig;
pub use env::IsolatedEnv;
pub use error::{BridgeError, Result};
pub use facenet::{
    Alignment, BoundingBox, Embedding, FaceOp, Landmarks, PythonFacenet, EMBEDDING_DIM,
    LANDMARK_VALUES,
};
pub use workers::{SessionState, WorkerSession};
