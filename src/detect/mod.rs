//! Object detection capability.
//!
//! Detectors are external collaborators hidden behind [`DetectorBackend`].
//! Nothing downstream of this module names a concrete model.

mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use registry::BackendRegistry;
pub use result::{Detection, DetectionResult, PixelBox};
