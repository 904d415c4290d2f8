use std::io::{Cursor, Read};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server, StatusCode};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::inference::config::ServeConfig;
use crate::inference::multipart::{extract_boundary, first_file_part};
use crate::inference::predictor::{InferenceResponse, InferenceService};

type Job = (Vec<u8>, SyncSender<Result<InferenceResponse>>);

/// Owns the single compute thread. Request threads hand uploads over
/// through a bounded queue and wait for the answer with a deadline.
pub struct InferenceWorker {
    jobs: SyncSender<Job>,
    timeout: Duration,
}

impl InferenceWorker {
    pub fn spawn(service: Arc<InferenceService>, timeout: Duration, queue_depth: usize) -> Result<InferenceWorker> {
        let (jobs, rx) = mpsc::sync_channel::<Job>(queue_depth.max(1));
        thread::Builder::new()
            .name("inference".to_string())
            .spawn(move || {
                for (bytes, reply) in rx {
                    // The requester may have given up already.
                    let _ = reply.send(service.predict_bytes(&bytes));
                }
            })?;
        Ok(InferenceWorker { jobs, timeout })
    }

    pub fn infer(&self, bytes: Vec<u8>) -> Result<InferenceResponse> {
        let (reply, answer) = mpsc::sync_channel(1);
        self.jobs.try_send((bytes, reply)).map_err(|e| match e {
            TrySendError::Full(_) => Error::Server("inference queue is full".to_string()),
            TrySendError::Disconnected(_) => Error::Server("inference thread has stopped".to_string()),
        })?;
        match answer.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "inference did not finish within {} ms", self.timeout.as_millis()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Server("inference thread has stopped".to_string())),
        }
    }
}

/// A status code and JSON body, independent of the HTTP library.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl ApiResponse {
    fn ok(body: serde_json::Value) -> ApiResponse {
        ApiResponse { status: 200, body }
    }

    /// `{"error": {"kind": ..., "message": ...}}` with a status matching the
    /// error category.
    pub fn error(err: &Error) -> ApiResponse {
        let (status, kind) = match err {
            Error::InvalidInput(_) => (400, "invalid_input"),
            Error::Timeout(_) => (504, "timeout"),
            Error::Server(_) => (503, "unavailable"),
            Error::RegionDetection(_) => (500, "region_detection"),
            Error::Checkpoint(_) => (500, "checkpoint"),
            _ => (500, "internal"),
        };
        ApiResponse::failure(status, kind, &err.to_string())
    }

    fn failure(status: u16, kind: &str, message: &str) -> ApiResponse {
        ApiResponse { status, body: json!({ "error": { "kind": kind, "message": message } }) }
    }

    fn into_http(self) -> Response<Cursor<Vec<u8>>> {
        let bytes = self.body.to_string().into_bytes();
        let len = bytes.len();
        Response::new(
            StatusCode(self.status),
            vec![Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap()],
            Cursor::new(bytes),
            Some(len),
            None,
        )
    }
}

/// Dispatches one request. `GET /health` and `POST /infer` are the only
/// routes.
pub fn route(worker: &InferenceWorker, method: &Method, url: &str, content_type: Option<&str>, body: Vec<u8>) -> ApiResponse {
    let path = url.split('?').next().unwrap_or("");
    match (method, path) {
        (Method::Get, "/health") => ApiResponse::ok(json!({ "status": "ok" })),
        (Method::Post, "/infer") => {
            let result = upload_bytes(content_type, body)
                .and_then(|bytes| worker.infer(bytes))
                .and_then(|response| Ok(serde_json::to_value(response)?));
            match result {
                Ok(value) => ApiResponse::ok(value),
                Err(e) => {
                    debug!("Rejected /infer: {}", e);
                    ApiResponse::error(&e)
                }
            }
        }
        (_, "/health") | (_, "/infer") => ApiResponse::failure(405, "method_not_allowed", "method not allowed"),
        _ => ApiResponse::failure(404, "not_found", &format!("no route for {}", path)),
    }
}

/// Accepts a raw `image/*` body or a multipart form with an image file part.
fn upload_bytes(content_type: Option<&str>, body: Vec<u8>) -> Result<Vec<u8>> {
    let content_type = content_type.unwrap_or("").trim();
    let lower = content_type.to_ascii_lowercase();
    if lower.starts_with("image/") {
        return Ok(body);
    }
    if !lower.starts_with("multipart/form-data") {
        return Err(Error::InvalidInput("Invalid file type".to_string()));
    }
    let boundary = extract_boundary(content_type)
        .ok_or_else(|| Error::InvalidInput("multipart body without boundary".to_string()))?;
    let part = first_file_part(&body, &boundary)
        .ok_or_else(|| Error::InvalidInput("no file part in upload".to_string()))?;
    match part.content_type.as_deref() {
        Some(t) if !t.to_ascii_lowercase().starts_with("image/") => {
            Err(Error::InvalidInput("Invalid file type".to_string()))
        }
        _ => Ok(part.data),
    }
}

/// Binds the configured address and serves until the process exits.
pub fn serve(service: InferenceService, config: &ServeConfig) -> Result<()> {
    let addr = config.address();
    let server = Server::http(&addr).map_err(|e| Error::Server(format!("cannot bind {}: {}", addr, e)))?;
    info!("Serving inference on http://{} (strategy {:?})", addr, service.strategy());

    let worker = Arc::new(InferenceWorker::spawn(Arc::new(service), config.request_timeout, config.queue_depth)?);
    let max_upload = config.max_upload_bytes;

    // Each request gets its own thread so a slow upload never holds up
    // health checks; inference itself stays on the worker thread.
    for request in server.incoming_requests() {
        let worker = worker.clone();
        thread::spawn(move || respond(request, &worker, max_upload));
    }
    Ok(())
}

fn respond(mut request: Request, worker: &InferenceWorker, max_upload: usize) {
    let method = request.method().clone();
    let url = request.url().to_owned();
    let content_type = request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Content-Type"))
        .map(|h| h.value.as_str().to_owned());

    let limit = max_upload as u64;
    let mut body = Vec::new();
    let response = match request.as_reader().take(limit + 1).read_to_end(&mut body) {
        Err(e) => ApiResponse::error(&Error::InvalidInput(format!("cannot read body: {}", e))),
        Ok(_) if body.len() > max_upload => ApiResponse::failure(
            413,
            "payload_too_large",
            &format!("upload exceeds {} bytes", max_upload),
        ),
        Ok(_) => route(worker, &method, &url, content_type.as_deref(), body),
    };
    debug!("{} {} -> {}", method, url, response.status);
    if let Err(e) = request.respond(response.into_http()) {
        warn!("Failed to send response for {}: {}", url, e);
    }
}
