pub mod detect;
pub mod embed;
pub mod engine;
pub mod error;
pub mod index;
pub mod quality;
pub mod types;
pub mod unknown;

pub use engine::{EngineConfig, RecognitionEngine};
pub use error::RecognitionError;
pub use index::{IdentityIndex, IndexSnapshot, ReloadOutcome};
pub use types::{FaceDetection, FaceRecord, RecognitionFrame, RecognitionResult};
pub use unknown::{Admission, Observation, UnknownPolicy};
