use std::fmt;
use std::path::Path;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Check what the overlay executor and registry mounts need.
/// An empty list means everything is present.
pub fn check_overlay_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("fuse-overlayfs") {
        missing.push(MissingPrereq {
            name: "fuse-overlayfs",
            purpose: "overlay mounts for RUN layers and the registry cache",
            install_hint: "zypper install fuse-overlayfs | apt install fuse-overlayfs | dnf install fuse-overlayfs | pacman -S fuse-overlayfs",
        });
    }

    if !command_exists("fusermount3") && !command_exists("fusermount") {
        missing.push(MissingPrereq {
            name: "fusermount",
            purpose: "unmounting overlays without root",
            install_hint: "part of fuse3 | apt install fuse3 | dnf install fuse3",
        });
    }

    if !Path::new("/dev/fuse").exists() {
        missing.push(MissingPrereq {
            name: "/dev/fuse",
            purpose: "FUSE device",
            install_hint: "modprobe fuse, or pass --device /dev/fuse to the build container",
        });
    }

    missing
}

/// Check that `kubectl` can be found for registry cache capture.
pub fn check_cluster_prereqs(kubectl: &str) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();
    if !command_exists(kubectl) && !Path::new(kubectl).is_file() {
        missing.push(MissingPrereq {
            name: "kubectl",
            purpose: "pod readiness checks before the registry snapshot",
            install_hint: "https://kubernetes.io/docs/tasks/tools/",
        });
    }
    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nStratum requires these tools to execute RUN layers and capture registry caches.");
    msg
}
