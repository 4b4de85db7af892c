use rollcall_core::{
    DescriptorExtractor, ExtractError, Extraction, ExtractorConfig, FaceAnalyzer, FaceModels,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OnceCell};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("model load task aborted: {0}")]
    LoadAborted(String),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from async callers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Extraction, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode `image` and run the extraction cascade on the engine thread.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Extraction, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Move `analyzer` onto a dedicated OS thread and start serving requests.
///
/// The analyzer is owned by that thread for its whole life, so inference
/// sessions never cross threads.
pub fn spawn_engine<A>(analyzer: A, config: &ExtractorConfig) -> Result<EngineHandle, EngineError>
where
    A: FaceAnalyzer + Send + 'static,
{
    let mut extractor = DescriptorExtractor::new(analyzer, config);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(steps = extractor.cascade().len(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let result = extractor.extract(&image);
                        // Caller may have timed out and gone away.
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

type Loader = Arc<dyn Fn() -> Result<EngineHandle, EngineError> + Send + Sync>;

/// Load-once access to the recognition engine.
///
/// The load runs in its own task on the blocking pool, so it keeps going
/// even if the caller that started it is dropped. Callers arriving while
/// that load is in flight wait for it instead of loading again. A failed
/// load leaves the slot empty so a later call can retry.
pub struct LazyEngine {
    cell: Arc<OnceCell<EngineHandle>>,
    loader: Loader,
}

impl LazyEngine {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<EngineHandle, EngineError> + Send + Sync + 'static,
    {
        Self {
            cell: Arc::new(OnceCell::new()),
            loader: Arc::new(loader),
        }
    }

    /// Engine backed by the SCRFD + ArcFace models in `model_dir`.
    pub fn onnx(model_dir: PathBuf, config: ExtractorConfig) -> Self {
        Self::new(move || {
            let models = FaceModels::load(&model_dir)?;
            tracing::info!(dir = %model_dir.display(), "recognition models loaded");
            spawn_engine(models, &config)
        })
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn handle(&self) -> Result<&EngineHandle, EngineError> {
        if let Some(handle) = self.cell.get() {
            return Ok(handle);
        }

        let cell = Arc::clone(&self.cell);
        let loader = Arc::clone(&self.loader);
        let load = tokio::spawn(async move {
            cell.get_or_try_init(|| async move {
                tracing::info!("loading recognition engine");
                tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| EngineError::LoadAborted(e.to_string()))?
            })
            .await
            .map(|_| ())
        });
        load.await
            .map_err(|e| EngineError::LoadAborted(e.to_string()))??;

        self.cell
            .get()
            .ok_or_else(|| EngineError::LoadAborted("engine slot empty after load".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{png, ColorAnalyzer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_extract_through_engine_thread() {
        let handle = spawn_engine(ColorAnalyzer, &ExtractorConfig::default()).unwrap();
        let out = handle.extract(png(200, 200, [200, 0, 0])).await.unwrap();
        assert_eq!(out.attempts, 1);
        assert!(out.descriptor.values()[0] > 0.99);
    }

    #[tokio::test]
    async fn test_extract_errors_come_back_typed() {
        let handle = spawn_engine(ColorAnalyzer, &ExtractorConfig::default()).unwrap();
        let err = handle.extract(png(50, 50, [200, 0, 0])).await.unwrap_err();
        assert!(matches!(err, EngineError::Extract(ExtractError::ImageTooSmall { .. })));

        let err = handle.extract(png(200, 200, [0, 0, 0])).await.unwrap_err();
        assert!(matches!(err, EngineError::Extract(ExtractError::NoFaceDetected { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_callers_share_one_load() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let engine = Arc::new(LazyEngine::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            spawn_engine(ColorAnalyzer, &ExtractorConfig::default())
        }));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let handle = engine.handle().await?;
                    handle.extract(png(160, 160, [0, 180, 0])).await
                })
            })
            .collect();
        for t in tasks {
            assert!(t.await.unwrap().is_ok());
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert!(engine.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_load_can_be_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let engine = LazyEngine::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EngineError::Extract(ExtractError::ModelNotFound("det_10g.onnx".into())))
            } else {
                spawn_engine(ColorAnalyzer, &ExtractorConfig::default())
            }
        });

        assert!(engine.handle().await.is_err());
        assert!(!engine.is_loaded());
        assert!(engine.handle().await.is_ok());
        assert!(engine.is_loaded());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abandoned_first_load_is_not_repeated() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let engine = LazyEngine::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            spawn_engine(ColorAnalyzer, &ExtractorConfig::default())
        });

        let first = tokio::time::timeout(Duration::from_millis(100), engine.handle()).await;
        assert!(first.is_err());
        assert!(!engine.is_loaded());

        assert!(engine.handle().await.is_ok());
        assert!(engine.is_loaded());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_onnx_engine_without_models_fails_lazily() {
        let engine = LazyEngine::onnx(PathBuf::from("/nonexistent/models"), ExtractorConfig::default());
        assert!(!engine.is_loaded());
        let err = engine.handle().await.err().unwrap();
        assert!(matches!(err, EngineError::Extract(ExtractError::ModelNotFound(_))));
    }
}
