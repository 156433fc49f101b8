use assert_cmd::{Command, cargo::cargo_bin_cmd};
use std::path::Path;
use std::process::Output;

pub fn sandward_cmd(cwd: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("sandward");
    cmd.arg("-C").arg(cwd);
    cmd
}

// Each integration test file is compiled as its own crate, and not all of them
// stage proposals.
#[allow(dead_code)]
pub fn field(stdout: &[u8], key: &str) -> String {
    let output = std::str::from_utf8(stdout).expect("stdout should be UTF-8");
    let prefix = format!("{key}: ");
    output
        .lines()
        .find_map(|line| line.strip_prefix(prefix.as_str()))
        .unwrap_or_else(|| panic!("field {key:?} not found in output:\n{output}"))
        .to_string()
}

#[allow(dead_code)]
pub fn propose(cwd: &Path, path: &str, content: &str) -> String {
    let output: Output = sandward_cmd(cwd)
        .args(["propose", path, "--content", content])
        .output()
        .expect("failed to run `sandward propose`");
    assert!(
        output.status.success(),
        "propose failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    field(&output.stdout, "id")
}

#[allow(dead_code)]
pub fn generate_manifest(cwd: &Path) {
    sandward_cmd(cwd).arg("manifest").assert().success();
}
