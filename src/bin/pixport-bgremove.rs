//! PixPort Background Removal CLI Tool
//!
//! Command-line interface for removing or replacing image backgrounds with the
//! memory-bounded pixport-bgremove library.

#[cfg(feature = "cli")]
use pixport_bgremove::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    eprintln!("CLI feature not enabled. Please rebuild with --features cli");
    std::process::exit(1);
}
