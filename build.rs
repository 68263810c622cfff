use std::process::Command;

fn main() {
    // git version info, "unknown" outside a checkout
    let git_hash = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rerun-if-changed=.git/HEAD");

    // the subtitle pipelines shell out to these at runtime
    for (tool, version_arg) in [("ffmpeg", "-version"), ("ffsubsync", "--version")] {
        let available = Command::new(tool)
            .arg(version_arg)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        if !available {
            println!("cargo:warning={} not found in PATH, some task types will fail", tool);
        }
    }
}
