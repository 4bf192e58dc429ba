//! External command helper (git, rclone, df, ...).

use std::path::Path;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub async fn run(program: &str, args: &[&str], cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    let output = cmd.output().await?;
    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// First line of `<program> --version`, or None if it is not installed.
pub async fn version_of(program: &str) -> Option<String> {
    let out = run(program, &["--version"], None).await.ok()?;
    if !out.success {
        return None;
    }
    // some tools (java) print the version on stderr
    let text = if out.stdout.trim().is_empty() {
        out.stderr
    } else {
        out.stdout
    };
    text.lines().next().map(|l| l.trim().to_string())
}
