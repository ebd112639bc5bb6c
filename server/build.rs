//! Build script for dockyard
//! Embeds the git revision and build time reported by `--version`

use std::process::Command;

use chrono::Utc;

fn git_revision() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let revision = String::from_utf8(output.stdout).ok()?;
    let revision = revision.trim();
    (!revision.is_empty()).then(|| revision.to_string())
}

fn main() {
    let git_hash = git_revision().unwrap_or_else(|| "unknown".to_string());
    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);

    // the repository root sits one level above this crate
    println!("cargo:rerun-if-changed=../.git/HEAD");
}
