//! Command implementations by domain.

pub mod agent;
pub mod approval;
pub mod system;
pub mod task;

use std::path::PathBuf;
use taia_kernel::config::load_config;
use taia_kernel::{BootOptions, TaiaKernel};

/// Global flags shared by every command.
pub struct Context {
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// Boot an in-process kernel over the configured store.
pub fn boot_kernel(ctx: &Context, run_recovery: bool) -> TaiaKernel {
    let config = load_config(ctx.config.as_deref());
    tracing::debug!(home = %config.home_dir.display(), run_recovery, "Booting kernel for CLI command");
    TaiaKernel::boot_with_options(
        config,
        BootOptions {
            run_recovery,
            in_memory: false,
        },
    )
    .unwrap_or_else(|e| {
        eprintln!("Failed to boot kernel: {e}");
        std::process::exit(1);
    })
}

/// Print `message` and exit with status 1.
pub fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

/// Parse a UUID-backed id argument or exit.
pub fn parse_uuid(kind: &str, raw: &str) -> uuid::Uuid {
    uuid::Uuid::parse_str(raw.trim()).unwrap_or_else(|_| fail(format!("Invalid {kind} id: {raw}")))
}

pub fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_default()
    );
}
