use super::{EXIT_FAILURE, EXIT_SUCCESS};
use std::path::Path;
use stratum_core::StratumConfig;
use stratum_store::{FileChainCache, ImageStore, LayerStore, StoreLayout};

pub fn run(config: &StratumConfig, store_path: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    check_prereqs(config, &mut checks, &mut all_pass);
    check_registry(config, &mut checks, &mut all_pass);

    let layout = StoreLayout::new(store_path);
    if store_path.join("store").exists() {
        checks.push(Check::pass("store_exists", "Store directory exists"));
        check_store(&layout, &mut checks, &mut all_pass);
        check_disk_space(store_path, &mut checks);
    } else {
        checks.push(Check::info(
            "store_exists",
            "Store not initialized (will be created on first build)",
        ));
    }

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(config: &StratumConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    if config.executor.backend != "overlay" {
        checks.push(Check::info(
            "runtime_prereqs",
            &format!("Executor '{}' needs no host tools", config.executor.backend),
        ));
        return;
    }
    let missing = stratum_runtime::check_overlay_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass(
            "runtime_prereqs",
            "Runtime prerequisites satisfied",
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "runtime_prereqs",
            &format!(
                "Missing prerequisites: {}",
                stratum_runtime::format_missing(&missing)
            ),
        ));
    }
}

fn check_registry(config: &StratumConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let Some(dir) = &config.registry.bind_dir else {
        checks.push(Check::info(
            "registry",
            "No registry directory configured (registry cache capture disabled)",
        ));
        return;
    };
    if dir.is_dir() {
        checks.push(Check::pass(
            "registry",
            &format!("Registry directory {} exists", dir.display()),
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "registry",
            &format!("Registry directory {} does not exist", dir.display()),
        ));
    }

    let missing = stratum_runtime::check_cluster_prereqs(&config.executor.kubectl);
    if missing.is_empty() {
        checks.push(Check::pass("kubectl", "kubectl available"));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "kubectl",
            &stratum_runtime::format_missing(&missing),
        ));
    }
}

fn check_store(layout: &StoreLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("store_version", "Store format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_version",
                &format!("Store version check failed: {e}"),
            ));
            return;
        }
    }

    // Every image must load and every realized layer it names must be present.
    let images = ImageStore::new(layout.clone());
    let layers = LayerStore::new(layout.clone());
    match images.list() {
        Ok(list) => {
            let mut broken = Vec::new();
            for (name, id) in &list {
                match images.get(id) {
                    Ok(image) => {
                        if image
                            .layers
                            .iter()
                            .any(|l| l.is_realized() && !layers.exists(&l.id))
                        {
                            broken.push(name.clone());
                        }
                    }
                    Err(_) => broken.push(name.clone()),
                }
            }
            if broken.is_empty() {
                checks.push(Check::pass(
                    "store_integrity",
                    &format!("Store integrity OK ({} images checked)", list.len()),
                ));
            } else {
                *all_pass = false;
                checks.push(Check::fail(
                    "store_integrity",
                    &format!("Broken images: {}", broken.join(", ")),
                ));
            }
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_integrity",
                &format!("Cannot read image index: {e}"),
            ));
        }
    }

    match (layers.list(), FileChainCache::open(layout)) {
        (Ok(ids), Ok(cache)) => checks.push(Check::info(
            "layers",
            &format!("{} layers, {} cached chains", ids.len(), cache.len()),
        )),
        (Err(e), _) | (_, Err(e)) => checks.push(Check::warn(
            "layers",
            &format!("Cannot read layer cache: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Stratum Doctor\n");
        for check in checks {
            let icon = match check.status.as_str() {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: String,
    message: String,
}

impl Check {
    fn pass(name: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: "pass".to_owned(),
            message: message.to_owned(),
        }
    }

    fn fail(name: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: "fail".to_owned(),
            message: message.to_owned(),
        }
    }

    fn warn(name: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: "warn".to_owned(),
            message: message.to_owned(),
        }
    }

    fn info(name: &str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: "info".to_owned(),
            message: message.to_owned(),
        }
    }
}

fn check_disk_space(store_path: &Path, checks: &mut Vec<Check>) {
    let Ok(c_path) = std::ffi::CString::new(store_path.to_string_lossy().as_bytes()) else {
        return;
    };

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: statvfs with a valid, NUL-terminated path and a properly
    // zeroed output struct is well-defined. The struct is stack-allocated
    // and only read after the call succeeds (ret == 0).
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return;
    }

    let avail_bytes = stat.f_bavail * stat.f_frsize;
    let avail_mb = avail_bytes / (1024 * 1024);

    if avail_mb < 100 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space: {avail_mb} MB available"),
        ));
    } else if avail_mb < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {avail_mb} MB available (consider freeing space)"),
        ));
    } else {
        let free_gb = avail_mb / 1024;
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {free_gb} GB available"),
        ));
    }
}
