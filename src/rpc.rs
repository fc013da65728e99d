//! JSON-RPC surface of the upload pipeline.
//!
//! The transport owns the sockets and calls into [`UploadService`] from its
//! event loop: text frames go to `handle_text`, binary frames to
//! `handle_binary`, and a periodic timer calls `poll` to collect final
//! responses and progress notifications. None of these block on loading.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::errors::RUNTIME_ERROR;
use crate::loader::LoaderRegistry;
use crate::param::ParameterDescriptor;
use crate::pipeline::LoadingPipeline;
use crate::progress::Progress;
use crate::scene::{LoadedModel, SharedScene};
use crate::task::{
    CancellableTask, ClientId, TaskOutcome, TaskRegistry, WorkerPool,
};
use crate::upload::{PathJob, UploadJob};
use crate::{Result, UploadError};

pub const METHOD_RECEIVE_BINARY: &str = "receive-binary";
pub const METHOD_UPLOAD_PATH: &str = "upload-path";
pub const METHOD_CANCEL: &str = "cancel";
pub const METHOD_PROGRESS: &str = "progress";

const PARSE_ERROR: i64 = -32700;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
/// Code of a cancelled request as seen by clients.
pub const CANCELLED_CODE: i64 = RUNTIME_ERROR;

const CATASTROPHIC_ERROR: &str = concat!(
    r#"{"jsonrpc":"2.0","id":null,"error":"#,
    r#"{"code":-32603,"message":"Failed to serialize response"}}"#
);

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct CancelParams {
    id: Value,
}

#[derive(Debug, Serialize)]
struct Response<'a> {
    jsonrpc: &'static str,
    id: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

#[derive(Debug, Serialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

impl<'a> Response<'a> {
    fn success(id: &'a Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(
        id: &'a Value,
        code: i64,
        message: String,
        data: Option<Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(ErrorObject {
                code,
                message,
                data,
            }),
        }
    }

    fn from_error(id: &'a Value, error: &UploadError) -> Self {
        Self::error(id, error.code(), error.to_string(), error.data())
    }

    fn from_outcome(
        id: &'a Value,
        outcome: &TaskOutcome<Vec<LoadedModel>>,
    ) -> Self {
        match outcome {
            TaskOutcome::Completed(_) => Self::success(id, Value::Bool(true)),
            TaskOutcome::Failed(error) => Self::from_error(id, error),
            TaskOutcome::Cancelled => {
                Self::from_error(id, &UploadError::Cancelled)
            }
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| CATASTROPHIC_ERROR.into())
    }
}

/// A message for one client.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub client: ClientId,
    pub message: String,
}

#[derive(Clone)]
enum Job {
    Upload(Arc<UploadJob>),
    Path(Arc<PathJob>),
}

impl Job {
    fn task(&self) -> &CancellableTask<Vec<LoadedModel>> {
        match self {
            Job::Upload(job) => job.task(),
            Job::Path(job) => job.task(),
        }
    }

    fn progress(&self) -> &Progress {
        self.task().progress()
    }

    fn cancel(&self) {
        match self {
            Job::Upload(job) => job.cancel(),
            Job::Path(job) => job.task().cancel(),
        }
    }
}

struct InFlight {
    client: ClientId,
    id: Value,
    job: Job,
}

pub struct UploadService {
    pipeline: Arc<LoadingPipeline>,
    pool: Option<WorkerPool>,
    uploads: TaskRegistry<UploadJob>,
    path_uploads: TaskRegistry<PathJob>,
    in_flight: Mutex<Vec<InFlight>>,
    responses: Arc<Mutex<Vec<Outgoing>>>,
    last_progress: Mutex<Option<Instant>>,
    progress_interval: Duration,
}

impl UploadService {
    pub fn new(config: PipelineConfig, scene: SharedScene) -> Result<Self> {
        config.validate()?;
        let registry = LoaderRegistry::with_defaults(&config);
        Self::with_registry(config, scene, registry)
    }

    pub fn with_registry(
        config: PipelineConfig,
        scene: SharedScene,
        registry: LoaderRegistry,
    ) -> Result<Self> {
        let pool = WorkerPool::new(config.worker_threads)?;
        let progress_interval = config.progress_interval();
        log::info!(
            "rpc: serving {:?} with {} workers",
            registry,
            pool.workers()
        );
        Ok(Self {
            pipeline: Arc::new(LoadingPipeline::new(registry, scene, config)),
            pool: Some(pool),
            uploads: TaskRegistry::new(),
            path_uploads: TaskRegistry::new(),
            in_flight: Mutex::new(Vec::new()),
            responses: Arc::new(Mutex::new(Vec::new())),
            last_progress: Mutex::new(None),
            progress_interval,
        })
    }

    pub fn pipeline(&self) -> &LoadingPipeline {
        &self.pipeline
    }

    pub fn supported_types(&self) -> Vec<String> {
        self.pipeline.supported_types().into_iter().collect()
    }

    /// Handle a text frame. Returns the immediate response, if any; the
    /// response of an accepted upload comes later from `poll`.
    pub fn handle_text(
        &self,
        client: ClientId,
        text: &str,
    ) -> Option<String> {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("rpc: client {} sent invalid JSON: {}", client, e);
                let message = "Parse error".to_owned();
                return Some(
                    Response::error(&Value::Null, PARSE_ERROR, message, None)
                        .to_json(),
                );
            }
        };
        let id = request.id.clone().unwrap_or(Value::Null);
        log::debug!(
            "rpc: client {} calls {} ({})",
            client,
            request.method,
            id
        );

        let params = request.params;
        match request.method.as_str() {
            METHOD_RECEIVE_BINARY => self.receive_binary(client, id, params),
            METHOD_UPLOAD_PATH => self.upload_path(client, id, params),
            METHOD_CANCEL => self.cancel(client, request.id, params),
            other => Some(
                Response::error(
                    &id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", other),
                    None,
                )
                .to_json(),
            ),
        }
    }

    /// Append a binary frame to the client's active upload. Frames without
    /// an active upload are logged and dropped.
    pub fn handle_binary(&self, client: ClientId, frame: &[u8]) {
        match self.uploads.get(client) {
            Some(job) => {
                if let Err(e) = job.append_chunk(frame) {
                    log::warn!(
                        "{}: {} byte frame rejected: {}",
                        job.task().label(),
                        frame.len(),
                        e
                    );
                }
            }
            None => log::warn!(
                "rpc: dropping {} byte frame from client {}, \
                 no binary request pending",
                frame.len(),
                client
            ),
        }
    }

    /// Timer callback: progress notifications (throttled) followed by the
    /// final responses of tasks that finished since the last poll.
    pub fn poll(&self) -> Vec<Outgoing> {
        let mut outgoing = Vec::new();
        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|entry| !entry.job.task().is_terminal());

        if self.progress_due() {
            for entry in in_flight.iter() {
                if let Some(report) = entry.job.progress().take_modified() {
                    let notification = json!({
                        "jsonrpc": "2.0",
                        "method": METHOD_PROGRESS,
                        "params": {
                            "id": entry.id,
                            "operation": report.operation,
                            "amount": report.amount,
                        },
                    });
                    outgoing.push(Outgoing {
                        client: entry.client,
                        message: notification.to_string(),
                    });
                }
            }
        }
        drop(in_flight);

        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        outgoing.append(&mut responses);
        outgoing
    }

    /// Cancel everything the client started.
    pub fn client_disconnected(&self, client: ClientId) {
        for entry in self.lock_in_flight().iter() {
            if entry.client == client {
                log::info!(
                    "rpc: client {} gone, cancelling {}",
                    client,
                    entry.id
                );
                entry.job.cancel();
            }
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.lock_in_flight()
            .iter()
            .filter(|entry| !entry.job.task().is_terminal())
            .count()
    }

    /// Cancel all tasks and wait up to `timeout` for the workers.
    pub fn shutdown(mut self, timeout: Duration) {
        for entry in self.lock_in_flight().iter() {
            entry.job.cancel();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown(timeout);
        }
    }

    fn receive_binary(
        &self,
        client: ClientId,
        id: Value,
        params: Value,
    ) -> Option<String> {
        let params: Vec<ParameterDescriptor> = match parse_params(&params) {
            Ok(params) => params,
            Err(response) => return Some(response.with_id(&id)),
        };
        let label = format!("upload/{}", id);
        let pipeline = Arc::clone(&self.pipeline);
        let job = match self
            .uploads
            .begin(client, || UploadJob::new(&label, params, pipeline))
        {
            Ok(job) => job,
            Err(e) => return Some(Response::from_error(&id, &e).to_json()),
        };
        self.start(client, id, Job::Upload(job))
    }

    fn upload_path(
        &self,
        client: ClientId,
        id: Value,
        params: Value,
    ) -> Option<String> {
        let paths: Vec<String> = match parse_params(&params) {
            Ok(paths) => paths,
            Err(response) => return Some(response.with_id(&id)),
        };
        let label = format!("upload-path/{}", id);
        let pipeline = Arc::clone(&self.pipeline);
        let job = match self
            .path_uploads
            .begin(client, || PathJob::new(&label, paths, pipeline))
        {
            Ok(job) => job,
            Err(e) => return Some(Response::from_error(&id, &e).to_json()),
        };
        log::debug!("{}: {} paths accepted", label, job.paths().len());
        self.start(client, id, Job::Path(job))
    }

    fn cancel(
        &self,
        client: ClientId,
        request_id: Option<Value>,
        params: Value,
    ) -> Option<String> {
        let target = serde_json::from_value::<CancelParams>(params)
            .ok()
            .map(|p| p.id);
        let mut found = false;
        if let Some(target) = &target {
            for entry in self.lock_in_flight().iter() {
                if entry.client == client && entry.id == *target {
                    entry.job.cancel();
                    found = true;
                }
            }
        }
        if !found {
            log::debug!(
                "rpc: client {} has no request {:?} to cancel",
                client,
                target
            );
        }
        request_id
            .map(|id| Response::success(&id, Value::Bool(found)).to_json())
    }

    fn start(&self, client: ClientId, id: Value, job: Job) -> Option<String> {
        let responses = Arc::clone(&self.responses);
        let response_id = id.clone();
        job.task().on_complete(move |outcome| {
            let message =
                Response::from_outcome(&response_id, outcome).to_json();
            responses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Outgoing { client, message });
        });

        self.lock_in_flight().push(InFlight {
            client,
            id,
            job: job.clone(),
        });
        let scheduled = match &self.pool {
            Some(pool) => job.task().schedule(pool),
            None => {
                Err(UploadError::Config("service is shut down".to_owned()))
            }
        };
        if let Err(e) = scheduled {
            // the task is failed already and its response queued
            log::error!(
                "rpc: could not schedule {}: {}",
                job.task().label(),
                e
            );
        }
        None
    }

    fn progress_due(&self) -> bool {
        let mut last = self
            .last_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.progress_interval => {
                false
            }
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Vec<InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An immediate error response still missing its request id.
struct ParamsError {
    code: i64,
    message: String,
}

impl ParamsError {
    fn with_id(self, id: &Value) -> String {
        Response::error(id, self.code, self.message, None).to_json()
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(
    params: &Value,
) -> std::result::Result<Vec<T>, ParamsError> {
    match params {
        Value::Null => Err(ParamsError {
            code: UploadError::MissingParams.code(),
            message: UploadError::MissingParams.to_string(),
        }),
        // a single object is accepted as a batch of one
        Value::Object(_) => serde_json::from_value::<T>(params.clone())
            .map(|param| vec![param])
            .map_err(invalid_params),
        _ => serde_json::from_value::<Vec<T>>(params.clone())
            .map_err(invalid_params),
    }
}

fn invalid_params(e: serde_json::Error) -> ParamsError {
    ParamsError {
        code: INVALID_PARAMS,
        message: format!("Invalid params: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::Scene;

    fn service() -> UploadService {
        let config = PipelineConfig {
            worker_threads: 1,
            progress_interval_ms: 0,
            ..PipelineConfig::default()
        };
        UploadService::new(config, Scene::shared()).unwrap()
    }

    fn parse(message: &str) -> Value {
        serde_json::from_str(message).unwrap()
    }

    #[test]
    fn unknown_method_and_garbage() {
        let service = service();
        let response = parse(
            &service
                .handle_text(1, r#"{"jsonrpc":"2.0","id":1,"method":"nope"}"#)
                .unwrap(),
        );
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(response["id"], 1);

        let response = parse(&service.handle_text(1, "{not json").unwrap());
        assert_eq!(response["error"]["code"], -32700);
    }

    #[test]
    fn missing_params() {
        let service = service();
        let request = r#"{"jsonrpc":"2.0","id":2,"method":"receive-binary"}"#;
        let response = parse(&service.handle_text(1, request).unwrap());
        assert_eq!(response["error"]["code"], -1731);
    }

    #[test]
    fn single_object_is_a_batch_of_one() {
        let params: Vec<ParameterDescriptor> =
            parse_params(&json!({"size": 4, "type": "xyz"})).ok().unwrap();
        assert_eq!(params, vec![ParameterDescriptor::new(4, "xyz")]);
    }

    #[test]
    fn binary_without_request_is_dropped() {
        let service = service();
        service.handle_binary(5, b"illegal");
        assert!(service.poll().is_empty());
        assert_eq!(service.pending_requests(), 0);
    }
}
