use super::{colorize_outcome, json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use std::path::Path;
use stratum_core::{BuildOptions, LayerOutcome, LocalBuilder, StratumConfig};

pub fn run(
    config: &StratumConfig,
    store_path: &Path,
    name: &str,
    context: &Path,
    kubefile: Option<&str>,
    options: BuildOptions,
    json: bool,
) -> Result<u8, String> {
    let builder = LocalBuilder::from_config(config, store_path).map_err(|e| e.to_string())?;

    let pb = if json {
        None
    } else {
        Some(spinner(&format!("building {name}...")))
    };

    let result = match builder.build(name, context, kubefile, options) {
        Ok(r) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, &format!("built {name}"));
            }
            r
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(e.to_string());
        }
    };

    if json {
        println!("{}", json_pretty(&result)?);
    } else {
        let new_start = result.layers.len().saturating_sub(result.outcomes.len());
        for (layer, outcome) in result.layers[new_start..].iter().zip(&result.outcomes) {
            let id = if layer.id.is_empty() {
                "-"
            } else {
                layer.id.short()
            };
            println!(
                "  {:<9} {:<14} {} {}",
                colorize_outcome(*outcome),
                id,
                layer.layer_type,
                layer.value
            );
        }
        println!(
            "{} layers ({} cached, {} built, {} skipped)",
            result.layers.len(),
            result.count(LayerOutcome::CacheHit),
            result.count(LayerOutcome::Executed),
            result.count(LayerOutcome::Skipped)
        );
        println!("image_id: {}", result.image_id);
    }
    Ok(EXIT_SUCCESS)
}
