pub mod build;
pub mod completions;
pub mod doctor;
pub mod images;
pub mod inspect;
pub mod rmi;

use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::time::Duration;
use stratum_core::LayerOutcome;
use stratum_store::{ImageStore, StoreLayout};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_KUBEFILE_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn plain_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_spinner())
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(plain_style());
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_outcome(outcome: LayerOutcome) -> String {
    use console::Style;
    match outcome {
        LayerOutcome::CacheHit => Style::new().green().apply_to("cached").to_string(),
        LayerOutcome::Executed => Style::new().cyan().apply_to("built").to_string(),
        LayerOutcome::Skipped => Style::new().yellow().bold().apply_to("skipped").to_string(),
        LayerOutcome::Captured => Style::new().blue().apply_to("captured").to_string(),
    }
}

/// Open the image index of an existing store. Read-only commands never
/// create a store.
pub fn open_images(store_path: &Path) -> Result<ImageStore, String> {
    let layout = StoreLayout::new(store_path);
    if !store_path.join("store").exists() {
        return Err(format!(
            "store error: no store at {} (run a build first)",
            store_path.display()
        ));
    }
    layout
        .verify_version()
        .map_err(|e| format!("store error: {e}"))?;
    Ok(ImageStore::new(layout))
}
