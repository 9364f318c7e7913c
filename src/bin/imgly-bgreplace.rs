//! IMG.LY Background Replacement Service
//!
//! HTTP service that replaces photo backgrounds with a solid color, built on
//! the imgly-bgreplace library.

#[cfg(feature = "cli")]
use imgly_bgreplace::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
