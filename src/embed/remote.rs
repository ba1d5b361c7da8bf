use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use super::{Embedder, ModelSpec};
use crate::error::{EmberError, Result};
use crate::protocol::{
    read_frame, write_frame, EmbedPayload, EmbedReply, HealthReply, Op, Request, Response, Status,
};
use crate::service;
use crate::workspace::Workspace;

/// Socket connect/read budget for an embed round-trip. Inference on a large
/// batch can take a while; health checks use a much shorter leash.
const EMBED_READ_TIMEOUT: Duration = Duration::from_secs(120);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Client side of the embedding service: the model lives in a long-lived
/// co-process, and this type is just a connection per request. `warm()`
/// spawns the server when none is healthy.
pub struct RemoteEmbedder {
    spec: &'static ModelSpec,
    root: PathBuf,
    socket_path: PathBuf,
    pid_path: PathBuf,
    idle_secs: u64,
}

impl RemoteEmbedder {
    pub fn new(spec: &'static ModelSpec, ws: &Workspace, idle_secs: u64) -> Self {
        Self {
            spec,
            root: ws.root().to_path_buf(),
            socket_path: ws.socket_path(),
            pid_path: ws.pid_path(),
            idle_secs,
        }
    }

    pub fn health(&self) -> Option<HealthReply> {
        let resp = self
            .request(
                Request {
                    op: Op::Health,
                    payload: serde_json::Value::Null,
                },
                HEALTH_TIMEOUT,
            )
            .ok()?;
        if resp.status != Status::Ok {
            return None;
        }
        serde_json::from_value(resp.payload).ok()
    }

    fn request(&self, req: Request, read_timeout: Duration) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path).map_err(|e| {
            EmberError::EmbedderFailure(format!(
                "cannot reach embedding service at {}: {e}",
                self.socket_path.display()
            ))
        })?;
        stream
            .set_read_timeout(Some(read_timeout))
            .and_then(|_| stream.set_write_timeout(Some(Duration::from_secs(10))))
            .map_err(|e| EmberError::EmbedderFailure(format!("socket setup: {e}")))?;

        let mut stream = stream;
        write_frame(&mut stream, &req)
            .map_err(|e| EmberError::EmbedderFailure(format!("send to embedding service: {e}")))?;
        read_frame(&mut stream)
            .map_err(|e| EmberError::EmbedderFailure(format!("read from embedding service: {e}")))
    }
}

impl Embedder for RemoteEmbedder {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn dim(&self) -> usize {
        self.spec.dim
    }

    fn fingerprint(&self) -> String {
        // Same computation as the in-process embedder: vectors are
        // interchangeable between the two deployment shapes of one model.
        self.spec.fingerprint()
    }

    fn warm(&self) -> Result<()> {
        if let Some(health) = self.health() {
            if health.fingerprint == self.fingerprint() {
                return Ok(());
            }
            tracing::warn!(
                "embedding service runs {} but config wants {}; restarting it",
                health.fingerprint,
                self.fingerprint()
            );
            service::stop_server(&self.socket_path, &self.pid_path)?;
        }

        service::spawn_server(
            &self.root,
            self.spec.name,
            &self.socket_path,
            &self.pid_path,
            self.idle_secs,
        )
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Err(EmberError::EmbedderFailure(
                "embed called with no texts".into(),
            ));
        }

        let req = Request {
            op: Op::Embed,
            payload: serde_json::to_value(EmbedPayload {
                texts: texts.to_vec(),
            })
            .map_err(|e| EmberError::EmbedderFailure(format!("encode request: {e}")))?,
        };

        let resp = self.request(req, EMBED_READ_TIMEOUT)?;
        if resp.status != Status::Ok {
            let detail = resp
                .error
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_else(|| "unspecified server error".into());
            return Err(EmberError::EmbedderFailure(detail));
        }

        let reply: EmbedReply = serde_json::from_value(resp.payload)
            .map_err(|e| EmberError::EmbedderFailure(format!("decode reply: {e}")))?;

        if reply.vectors.len() != texts.len() {
            return Err(EmberError::EmbedderFailure(format!(
                "service returned {} vectors for {} texts",
                reply.vectors.len(),
                texts.len()
            )));
        }
        if reply.dim != self.spec.dim || reply.vectors.iter().any(|v| v.len() != self.spec.dim) {
            return Err(EmberError::EmbedderFailure(format!(
                "service returned dimension {}, expected {}",
                reply.dim, self.spec.dim
            )));
        }

        Ok(reply.vectors)
    }
}
