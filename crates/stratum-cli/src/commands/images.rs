use super::{json_pretty, open_images, EXIT_SUCCESS};
use std::path::Path;

pub fn run(store_path: &Path, json: bool) -> Result<u8, String> {
    let images = open_images(store_path)?;
    let list = images.list().map_err(|e| format!("store error: {e}"))?;
    if json {
        let payload: Vec<_> = list
            .iter()
            .map(|(name, id)| serde_json::json!({ "name": name, "image_id": id }))
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else if list.is_empty() {
        println!("no images found");
    } else {
        println!("{:<32} {:<14} LAYERS", "NAME", "IMAGE_ID");
        for (name, id) in &list {
            let layers = images
                .get(id)
                .map(|image| image.layers.len().to_string())
                .unwrap_or_else(|_| "?".to_owned());
            println!("{:<32} {:<14} {layers}", name, id.short());
        }
    }
    Ok(EXIT_SUCCESS)
}
