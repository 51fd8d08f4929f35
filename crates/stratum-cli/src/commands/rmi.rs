use super::{json_pretty, open_images, EXIT_SUCCESS};
use std::path::Path;
use stratum_core::StoreLock;
use stratum_store::StoreLayout;

pub fn run(store_path: &Path, name: &str, json: bool) -> Result<u8, String> {
    let images = open_images(store_path)?;
    let layout = StoreLayout::new(store_path);
    let _lock = StoreLock::acquire(&layout.lock_file()).map_err(|e| format!("store lock: {e}"))?;

    images
        .remove(name)
        .map_err(|e| format!("store error: {e}"))?;
    if json {
        let payload = serde_json::json!({ "name": name, "status": "removed" });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("removed image '{name}'");
    }
    Ok(EXIT_SUCCESS)
}
