use super::{json_pretty, open_images, EXIT_SUCCESS};
use std::path::Path;
use stratum_schema::CLUSTERFILE_ANNOTATION;

pub fn run(store_path: &Path, name: &str, json: bool) -> Result<u8, String> {
    let images = open_images(store_path)?;
    let image = images
        .get_by_name(name)
        .map_err(|e| format!("store error: {e}"))?;
    if json {
        println!("{}", json_pretty(&image)?);
    } else {
        println!("name:      {name}");
        println!("image_id:  {}", image.id);
        println!("layers:    {}", image.layers.len());
        for (i, layer) in image.layers.iter().enumerate() {
            let id = if layer.id.is_empty() {
                "(skipped)"
            } else {
                layer.id.short()
            };
            println!("  {i:>3}  {id:<14} {} {}", layer.layer_type, layer.value);
        }
        for (key, value) in &image.annotations {
            if key == CLUSTERFILE_ANNOTATION {
                println!("{key}:");
                for line in value.lines() {
                    println!("  {line}");
                }
            } else {
                println!("{key}: {value}");
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
