//! Deterministic stand-in for the Python face worker.
//!
//! Speaks the same JSON Lines protocol on stdin/stdout as
//! `python3/facenet_bridge.py` without any model:
//!
//! - `align` reports one face per pure white pixel
//! - `embedding` derives a 128-value vector from the mean pixel value
//! - `base64_to_image` / `image_to_base64` run the real codec
//!
//! Extra methods for exercising the host side: `echo(value, delay_ms)`,
//! `env(name)`, `garbage()` (writes a non-JSON line), `crash(code)` (exits
//! without replying).
//!
//! Setting `FACENET_STUB_FAIL_MODEL=1` makes both model loads fail, and
//! `FACENET_LOG_FORMAT=json` switches its stderr logs to JSON.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use facenet_bridge::codec::{self, BridgeReply, CallFrame, EncodedBuffer, ImageTensor, QUIT_METHOD};
use facenet_bridge::{telemetry, EMBEDDING_DIM};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const FAIL_MODEL_VAR: &str = "FACENET_STUB_FAIL_MODEL";
const LOG_FORMAT_VAR: &str = "FACENET_LOG_FORMAT";

enum Step {
    Reply(BridgeReply),
    Raw(&'static str),
    Exit(i32),
    Quit,
}

#[derive(Default)]
struct StubWorker {
    mtcnn_loaded: bool,
    facenet_loaded: bool,
}

impl StubWorker {
    fn dispatch(&mut self, call: &CallFrame) -> Step {
        let result = match call.method.as_str() {
            QUIT_METHOD => return Step::Quit,
            "garbage" => return Step::Raw("this is not a frame"),
            "crash" => {
                let code = call.args.first().and_then(Value::as_i64).unwrap_or(3);
                return Step::Exit(i32::try_from(code).unwrap_or(3));
            }
            "init_mtcnn" => self.load_model("mtcnn").map(|()| {
                self.mtcnn_loaded = true;
                Value::Null
            }),
            "init_facenet" => self.load_model("facenet").map(|()| {
                self.facenet_loaded = true;
                Value::Null
            }),
            "align" => self.align(&call.args),
            "embedding" => self.embedding(&call.args),
            "base64_to_image" => decode_image(&call.args).map(|image| json!(image.to_nested())),
            "image_to_base64" => encode_image(&call.args),
            "echo" => Ok(echo(&call.args)),
            "env" => Ok(env_value(&call.args)),
            other => Err(format!("unknown method: {other}")),
        };

        Step::Reply(match result {
            Ok(payload) => BridgeReply::Ok(payload),
            Err(message) => BridgeReply::Failed(message),
        })
    }

    fn load_model(&self, model: &str) -> Result<(), String> {
        if std::env::var(FAIL_MODEL_VAR).is_ok_and(|v| v == "1") {
            return Err(format!("{model} weights missing or corrupt"));
        }
        info!(model, "Model loaded");
        Ok(())
    }

    fn align(&self, args: &[Value]) -> Result<Value, String> {
        if !self.mtcnn_loaded {
            return Err("MTCNN not initialised, call init_mtcnn first".into());
        }
        let image = decode_image(args)?;

        let mut boxes = Vec::new();
        let mut landmarks = Vec::new();
        for row in 0..image.rows() {
            for col in 0..image.cols() {
                let white = image
                    .pixel(row, col)
                    .is_some_and(|p| !p.is_empty() && p.iter().all(|v| *v == 255));
                if !white {
                    continue;
                }
                let (x, y) = (col as f64, row as f64);
                let confidence = 0.99 - 0.01 * boxes.len().min(50) as f64;
                boxes.push(json!([x, y, x + 1.0, y + 1.0, confidence]));
                landmarks.push(json!([
                    x + 0.3, x + 0.7, x + 0.5, x + 0.35, x + 0.65,
                    y + 0.3, y + 0.3, y + 0.5, y + 0.75, y + 0.75
                ]));
            }
        }

        Ok(json!([boxes, landmarks]))
    }

    fn embedding(&self, args: &[Value]) -> Result<Value, String> {
        if !self.facenet_loaded {
            return Err("FaceNet not initialised, call init_facenet first".into());
        }
        let image = decode_image(args)?;
        let bytes = image.as_bytes();
        let mean = if bytes.is_empty() {
            0.0
        } else {
            bytes.iter().map(|b| f64::from(*b)).sum::<f64>() / (bytes.len() as f64 * 255.0)
        };

        let vector: Vec<f64> = (0..EMBEDDING_DIM)
            .map(|i| ((i as f64).mul_add(0.618_034, mean).fract() - 0.5) * 0.8)
            .collect();
        Ok(json!(vector))
    }
}

fn decode_image(args: &[Value]) -> Result<ImageTensor, String> {
    EncodedBuffer::from_args(args)
        .and_then(|buffer| buffer.decode())
        .map_err(|e| e.to_string())
}

fn encode_image(args: &[Value]) -> Result<Value, String> {
    let nested: Vec<Vec<Vec<u8>>> = args
        .first()
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| e.to_string())?
        .ok_or("image_to_base64 expects one argument")?;
    let image = ImageTensor::from_nested(&nested).map_err(|e| e.to_string())?;
    Ok(Value::String(image.to_base64()))
}

fn echo(args: &[Value]) -> Value {
    let delay_ms = args.get(1).and_then(Value::as_u64).unwrap_or(0);
    if delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(delay_ms));
    }
    args.first().cloned().unwrap_or(Value::Null)
}

fn env_value(args: &[Value]) -> Value {
    args.first()
        .and_then(Value::as_str)
        .and_then(|name| std::env::var(name).ok())
        .map_or(Value::Null, Value::String)
}

fn main() -> anyhow::Result<()> {
    if std::env::var(LOG_FORMAT_VAR).is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        telemetry::init_tracing_json("facenet_stub_worker");
    } else {
        telemetry::init_tracing("facenet_stub_worker");
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut worker = StubWorker::default();

    for line in stdin.lock().lines() {
        let line = line.context("failed to read call frame")?;
        if line.trim().is_empty() {
            continue;
        }

        let step = match codec::decode_call(line.as_bytes()) {
            Ok(call) => {
                debug!(method = %call.method, "Dispatching call");
                worker.dispatch(&call)
            }
            Err(e) => {
                warn!(error = %e, "Malformed call frame");
                Step::Reply(BridgeReply::Failed(format!("malformed call: {e}")))
            }
        };

        match step {
            Step::Reply(reply) => {
                stdout.write_all(&codec::encode_reply(&reply)?)?;
            }
            Step::Raw(text) => {
                writeln!(stdout, "{text}")?;
            }
            Step::Exit(code) => {
                warn!(code, "Exiting without a reply");
                std::process::exit(code);
            }
            Step::Quit => {
                info!("Quit requested");
                break;
            }
        }
        stdout.flush()?;
    }

    Ok(())
}
