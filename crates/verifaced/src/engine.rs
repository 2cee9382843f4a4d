use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use veriface_core::{FaceMatcher, MatchResult, QualityReport};

/// Queued requests per worker before senders wait.
const QUEUE_DEPTH_PER_WORKER: usize = 4;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] veriface_core::detector::DetectorError),
    #[error("face operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine workers exited")]
    ChannelClosed,
    #[error("engine startup failed: {0}")]
    Startup(String),
}

/// Messages sent from async handlers to the engine workers.
enum EngineRequest {
    ValidateQuality {
        image: Vec<u8>,
        reply: oneshot::Sender<QualityReport>,
    },
    Compare {
        reference: Vec<u8>,
        live: Vec<u8>,
        reply: oneshot::Sender<MatchResult>,
    },
}

/// Clone-safe handle to the engine worker pool.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    timeout: Option<Duration>,
    workers: usize,
    detector: String,
}

impl EngineHandle {
    /// Single-photo quality check.
    pub async fn validate_quality(&self, image: Vec<u8>) -> Result<QualityReport, EngineError> {
        self.request(|reply| EngineRequest::ValidateQuality { image, reply })
            .await
    }

    /// Reference-vs-live face comparison.
    pub async fn compare(&self, reference: Vec<u8>, live: Vec<u8>) -> Result<MatchResult, EngineError> {
        self.request(|reply| EngineRequest::Compare {
            reference,
            live,
            reply,
        })
        .await
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn detector_name(&self) -> &str {
        &self.detector
    }

    /// Send one request and wait for its reply. On timeout the worker still
    /// finishes the job; its reply is dropped.
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, reply_rx)
                .await
                .map_err(|_| EngineError::Timeout(limit))?
                .map_err(|_| EngineError::ChannelClosed),
            None => reply_rx.await.map_err(|_| EngineError::ChannelClosed),
        }
    }
}

/// Spawn `workers` OS threads, each owning a [`FaceMatcher`] built by
/// `factory`.
///
/// Every matcher is built before any thread starts, so a missing model fails
/// startup instead of the first request.
pub fn spawn_engine<F>(
    workers: usize,
    timeout: Option<Duration>,
    mut factory: F,
) -> Result<EngineHandle, EngineError>
where
    F: FnMut() -> Result<FaceMatcher, EngineError>,
{
    if workers == 0 {
        return Err(EngineError::Startup("at least one worker is required".into()));
    }

    let matchers = (0..workers)
        .map(|_| factory())
        .collect::<Result<Vec<_>, _>>()?;
    let detector = matchers[0].detector_name().to_string();
    tracing::info!(workers, detector = %detector, ?timeout, "face matchers ready");

    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * QUEUE_DEPTH_PER_WORKER);
    let rx = Arc::new(Mutex::new(rx));

    for (id, mut matcher) in matchers.into_iter().enumerate() {
        let rx = Arc::clone(&rx);
        std::thread::Builder::new()
            .name(format!("veriface-engine-{id}"))
            .spawn(move || {
                tracing::debug!(worker = id, "engine worker started");
                loop {
                    // Only the receive holds the lock; work runs unlocked.
                    let next = rx.lock().unwrap_or_else(|e| e.into_inner()).blocking_recv();
                    let Some(req) = next else { break };
                    handle_request(&mut matcher, id, req);
                }
                tracing::debug!(worker = id, "engine worker exiting");
            })
            .map_err(|e| EngineError::Startup(format!("spawning worker {id}: {e}")))?;
    }

    Ok(EngineHandle {
        tx,
        timeout,
        workers,
        detector,
    })
}

fn handle_request(matcher: &mut FaceMatcher, worker: usize, req: EngineRequest) {
    match req {
        EngineRequest::ValidateQuality { image, reply } => {
            let report = matcher.validate_quality(&image);
            tracing::debug!(worker, valid = report.is_valid, "quality check done");
            let _ = reply.send(report);
        }
        EngineRequest::Compare {
            reference,
            live,
            reply,
        } => {
            let result = matcher.compare(&reference, &live);
            tracing::debug!(worker, matched = result.matched, "comparison done");
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face_png, matcher_with, PatchDetector, SlowDetector};

    #[tokio::test]
    async fn test_pool_serves_concurrent_requests() {
        let engine = spawn_engine(3, None, || Ok(matcher_with(PatchDetector))).unwrap();
        assert_eq!(engine.workers(), 3);
        assert_eq!(engine.detector_name(), "patch");

        let photo = face_png(11);
        let mut tasks = Vec::new();
        for _ in 0..6 {
            let engine = engine.clone();
            let photo = photo.clone();
            tasks.push(tokio::spawn(async move {
                engine.compare(photo.clone(), photo).await
            }));
        }
        for task in tasks {
            let result = task.await.unwrap().unwrap();
            assert!(result.matched);
        }
    }

    #[tokio::test]
    async fn test_validate_quality_roundtrip() {
        let engine = spawn_engine(1, None, || Ok(matcher_with(PatchDetector))).unwrap();
        let report = engine.validate_quality(face_png(12)).await.unwrap();
        assert!(report.is_valid, "{}", report.reason);
    }

    #[tokio::test]
    async fn test_timeout() {
        let limit = Duration::from_millis(50);
        let engine = spawn_engine(1, Some(limit), || Ok(matcher_with(SlowDetector(Duration::from_millis(500))))).unwrap();
        let err = engine.compare(face_png(1), face_png(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Timeout(d) if d == limit));
    }

    #[test]
    fn test_factory_failure_fails_startup() {
        let err = spawn_engine(2, None, || {
            Err(EngineError::Detector(veriface_core::detector::DetectorError::ModelNotFound(
                "/nowhere/det_10g.onnx".into(),
            )))
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("det_10g.onnx"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(matches!(
            spawn_engine(0, None, || Ok(matcher_with(PatchDetector))),
            Err(EngineError::Startup(_))
        ));
    }
}
