//! Typed MTCNN/FaceNet operations over a worker session.
//!
//! The worker's callable surface is the closed set [`FaceOp`]; each
//! operation lowers to exactly one [`BridgeCall`] and its reply payload is
//! decoded into a typed result.

use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{BridgeCall, CodecError, ImageTensor};
use crate::config::SessionConfig;
use crate::error::{BridgeError, Result};
use crate::workers::WorkerSession;

/// Length of a FaceNet embedding vector.
pub const EMBEDDING_DIM: usize = 128;

/// Values per landmark set: five points, x coordinates first, then y.
pub const LANDMARK_VALUES: usize = 10;

/// Face bounding box as reported by MTCNN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// Detection confidence in (0, 1).
    pub confidence: f32,
}

impl From<[f32; 5]> for BoundingBox {
    fn from([x1, y1, x2, y2, confidence]: [f32; 5]) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
        }
    }
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }
}

/// Five facial landmarks laid out as `[x1..x5, y1..y5]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks(pub [f32; LANDMARK_VALUES]);

impl Landmarks {
    /// The five `(x, y)` points.
    pub fn points(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        let (xs, ys) = self.0.split_at(LANDMARK_VALUES / 2);
        xs.iter().copied().zip(ys.iter().copied())
    }
}

impl TryFrom<Vec<f32>> for Landmarks {
    type Error = CodecError;

    fn try_from(values: Vec<f32>) -> std::result::Result<Self, Self::Error> {
        let len = values.len();
        <[f32; LANDMARK_VALUES]>::try_from(values)
            .map(Self)
            .map_err(|_| {
                CodecError::UnexpectedPayload(format!(
                    "landmark set has {len} values, expected {LANDMARK_VALUES}"
                ))
            })
    }
}

/// Result of `align()`: one bounding box and one landmark set per face, in
/// the same order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Alignment {
    pub bounding_boxes: Vec<BoundingBox>,
    pub landmarks: Vec<Landmarks>,
}

impl Alignment {
    /// Decode the `[bounding_boxes, landmarks]` reply payload.
    pub fn from_payload(payload: Value) -> std::result::Result<Self, CodecError> {
        let (boxes, marks): (Vec<[f32; 5]>, Vec<Vec<f32>>) = serde_json::from_value(payload)?;
        if boxes.len() != marks.len() {
            return Err(CodecError::UnexpectedPayload(format!(
                "{} bounding boxes but {} landmark sets",
                boxes.len(),
                marks.len()
            )));
        }

        Ok(Self {
            bounding_boxes: boxes.into_iter().map(BoundingBox::from).collect(),
            landmarks: marks
                .into_iter()
                .map(Landmarks::try_from)
                .collect::<std::result::Result<_, _>>()?,
        })
    }

    /// Number of detected faces.
    pub fn len(&self) -> usize {
        self.bounding_boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bounding_boxes.is_empty()
    }

    /// Bounding box and landmarks of each face.
    pub fn faces(&self) -> impl Iterator<Item = (&BoundingBox, &Landmarks)> {
        self.bounding_boxes.iter().zip(&self.landmarks)
    }
}

/// FaceNet embedding of one aligned face.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding(Vec<f32>);

impl Embedding {
    /// Decode a reply payload, requiring exactly [`EMBEDDING_DIM`] values.
    pub fn from_payload(payload: Value) -> std::result::Result<Self, CodecError> {
        let values: Vec<f32> = serde_json::from_value(payload)?;
        if values.len() != EMBEDDING_DIM {
            return Err(CodecError::UnexpectedPayload(format!(
                "embedding has {} values, expected {EMBEDDING_DIM}",
                values.len()
            )));
        }
        Ok(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Euclidean distance to another embedding.
    pub fn distance(&self, other: &Self) -> f32 {
        self.0
            .iter()
            .zip(&other.0)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// The worker's callable surface.
#[derive(Debug, Clone, Copy)]
pub enum FaceOp<'a> {
    /// Load the MTCNN detector
    InitMtcnn,
    /// Load the FaceNet embedding model
    InitFacenet,
    /// Detect faces and landmarks
    Align(&'a ImageTensor),
    /// Embed one pre-aligned face
    Embedding(&'a ImageTensor),
    /// Have the worker regroup a base64 buffer into a nested array
    Base64ToImage {
        text: &'a str,
        rows: usize,
        cols: usize,
        depth: usize,
    },
    /// Have the worker base64-encode a nested array
    ImageToBase64(&'a ImageTensor),
}

impl FaceOp<'_> {
    /// Method name on the wire.
    pub const fn method(&self) -> &'static str {
        match self {
            Self::InitMtcnn => "init_mtcnn",
            Self::InitFacenet => "init_facenet",
            Self::Align(_) => "align",
            Self::Embedding(_) => "embedding",
            Self::Base64ToImage { .. } => "base64_to_image",
            Self::ImageToBase64(_) => "image_to_base64",
        }
    }

    pub fn to_call(&self) -> BridgeCall {
        let call = BridgeCall::new(self.method());
        match *self {
            Self::InitMtcnn | Self::InitFacenet => call,
            Self::Align(image) | Self::Embedding(image) => call.with_image(image),
            Self::Base64ToImage {
                text,
                rows,
                cols,
                depth,
            } => call
                .with_value(text)
                .with_value(rows)
                .with_value(cols)
                .with_value(depth),
            Self::ImageToBase64(image) => call.with_value(nested_value(image)),
        }
    }
}

fn nested_value(image: &ImageTensor) -> Value {
    Value::Array(
        image
            .to_nested()
            .into_iter()
            .map(|row| {
                Value::Array(
                    row.into_iter()
                        .map(|pixel| Value::Array(pixel.into_iter().map(Value::from).collect()))
                        .collect(),
                )
            })
            .collect(),
    )
}

/// Face detection and embedding backed by a Python worker.
pub struct PythonFacenet {
    session: WorkerSession,
}

impl PythonFacenet {
    /// Start a worker with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the environment is missing or the worker cannot
    /// be spawned.
    pub async fn start(config: SessionConfig) -> Result<Self> {
        Ok(Self::with_session(WorkerSession::spawn(config).await?))
    }

    /// Wrap an existing session.
    pub fn with_session(session: WorkerSession) -> Self {
        Self { session }
    }

    pub const fn session(&self) -> &WorkerSession {
        &self.session
    }

    async fn run(&self, op: FaceOp<'_>) -> Result<Value> {
        debug!(method = op.method(), "Running face operation");
        self.session.invoke(&op.to_call()).await
    }

    /// Load the MTCNN detector. Required before [`Self::align`].
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ModelLoad` if the worker fails to load the
    /// detector; the session stays usable.
    pub async fn init_mtcnn(&self) -> Result<()> {
        self.run(FaceOp::InitMtcnn)
            .await
            .map_err(|e| model_load_error("MTCNN", e))?;
        info!("MTCNN detector loaded");
        Ok(())
    }

    /// Load the FaceNet model. Required before [`Self::embedding`].
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::ModelLoad` if the worker fails to load the model.
    pub async fn init_facenet(&self) -> Result<()> {
        self.run(FaceOp::InitFacenet)
            .await
            .map_err(|e| model_load_error("FaceNet", e))?;
        info!("FaceNet model loaded");
        Ok(())
    }

    /// Detect faces. Zero faces yields an empty alignment.
    ///
    /// # Arguments
    ///
    /// * `image` - RGB image as `[row][col][channel]`
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Remote` if MTCNN is not loaded, and a codec error
    /// if boxes and landmark sets do not line up.
    pub async fn align(&self, image: &ImageTensor) -> Result<Alignment> {
        let payload = self.run(FaceOp::Align(image)).await?;
        let alignment = Alignment::from_payload(payload)?;
        debug!(faces = alignment.len(), "Alignment decoded");
        Ok(alignment)
    }

    /// Embed a face. `image` must already be aligned and cropped to a single
    /// face; this is not checked.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Remote` if FaceNet is not loaded, and a codec
    /// error unless the vector has [`EMBEDDING_DIM`] values.
    pub async fn embedding(&self, image: &ImageTensor) -> Result<Embedding> {
        let payload = self.run(FaceOp::Embedding(image)).await?;
        Ok(Embedding::from_payload(payload)?)
    }

    /// Let the worker decode a base64 buffer into a `rows x cols x depth` image.
    ///
    /// # Arguments
    ///
    /// * `text` - Standard padded base64 of the flat row-major bytes
    /// * `rows`, `cols`, `depth` - Shape to regroup the bytes into
    ///
    /// # Errors
    ///
    /// Returns a codec error without contacting the worker if the shape
    /// overflows, and `BridgeError::Remote` if the byte count does not match.
    pub async fn base64_to_image(
        &self,
        text: &str,
        rows: usize,
        cols: usize,
        depth: usize,
    ) -> Result<ImageTensor> {
        let len = ImageTensor::byte_len(rows, cols, depth)?;
        let payload = self
            .run(FaceOp::Base64ToImage {
                text,
                rows,
                cols,
                depth,
            })
            .await?;

        if len == 0 {
            return Ok(ImageTensor::new(rows, cols, depth, Vec::new())?);
        }

        let nested: Vec<Vec<Vec<u8>>> = serde_json::from_value(payload).map_err(CodecError::from)?;
        let image = ImageTensor::from_nested(&nested)?;
        if image.shape() != (rows, cols, depth) {
            return Err(CodecError::UnexpectedPayload(format!(
                "worker returned shape {:?}, expected {:?}",
                image.shape(),
                (rows, cols, depth)
            ))
            .into());
        }
        Ok(image)
    }

    /// Let the worker base64-encode an image.
    pub async fn image_to_base64(&self, image: &ImageTensor) -> Result<String> {
        match self.run(FaceOp::ImageToBase64(image)).await? {
            Value::String(text) => Ok(text),
            other => Err(CodecError::UnexpectedPayload(format!("expected base64 text, got {other}")).into()),
        }
    }

    /// Shut the worker down. Safe to call more than once.
    pub async fn quit(&self) -> Result<()> {
        self.session.quit().await
    }
}

fn model_load_error(model: &'static str, error: BridgeError) -> BridgeError {
    match error {
        BridgeError::Remote { message, .. } => BridgeError::ModelLoad { model, message },
        other => other,
    }
}
