//! Pipeline stage services
//!
//! Each stage of the background replacement pipeline lives in its own
//! service so the processor only sequences them.

pub mod artifacts;
pub mod compositor;
pub mod input;
pub mod remover;

pub use artifacts::{ArtifactNamespace, ArtifactStore};
pub use compositor::{CompositeImage, Compositor};
pub use input::InputResolver;
pub use remover::{BackgroundRemovalService, SubprocessRemover};
