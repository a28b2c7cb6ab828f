use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecognitionError {
    /// Warm-up has not completed; callers should keep the worker in Connecting.
    #[error("recognition model not loaded yet")]
    ModelNotLoaded,

    /// A recognition request is already in flight; the frame should be skipped.
    #[error("recognition engine busy")]
    Busy,

    /// The compute thread is gone; the worker must restart.
    #[error("recognition engine stopped")]
    EngineStopped,

    /// `reload_index` was handed a snapshot older than the live one.
    #[error("index version mismatch: have {current}, got {requested}")]
    VersionMismatch { current: u64, requested: u64 },

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("inference failed: {0}")]
    Inference(#[from] ort::OrtError),

    #[error("tensor shape mismatch: {0}")]
    Shape(#[from] ndarray::ShapeError),
}
