//! Small parsing helpers shared by the services and the HTTP layer

pub mod color;

pub use color::{BackdropColor, ColorParser};
