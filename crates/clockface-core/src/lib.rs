//! clockface-core — Face template enrollment and verification engine.
//!
//! Turns a noisy stream of detector output into a durable averaged template
//! (enrollment) or an accept/reject decision (verification). The detector
//! itself is an external backend behind [`detector::FaceDetector`].

pub mod accumulator;
pub mod config;
pub mod detector;
pub mod engine;
pub mod enrollment;
pub mod repository;
pub mod scorer;
pub mod session;
pub mod template;
pub mod types;
pub mod verification;

pub use config::EngineConfig;
pub use detector::{FaceDetector, FrameSource, ModelService, ModelState};
pub use engine::{Engine, EngineError};
pub use enrollment::{EnrollmentController, EnrollmentEvent, EnrollmentState};
pub use repository::{MemoryRepository, StaticThreshold, TemplateRepository, ThresholdSource};
pub use session::{stop_pair, StopHandle, StopSignal};
pub use types::{Descriptor, Detection, StoredTemplate, TrainingStep, DESCRIPTOR_LEN};
pub use verification::{Verdict, VerificationController, VerificationEvent, VerificationState};
