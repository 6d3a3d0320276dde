//! Terminal driver: thin shim over detached tmux sessions.
//!
//! Session creation returns a typed [`TerminalError`] so spawn can surface
//! the multiplexer's stderr; every other primitive is infallible in type,
//! logging failures and reporting `false`/empty. All subprocess calls are
//! bounded by [`TMUX_TIMEOUT`].

use crate::error::TerminalError;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Timeout applied to every tmux subprocess call.
pub const TMUX_TIMEOUT: Duration = Duration::from_secs(10);

/// Wide geometry used for new sessions and for resizing recovered ones,
/// so the agent TUI wraps consistently regardless of who attached first.
pub const PANE_WIDTH: u32 = 250;
pub const PANE_HEIGHT: u32 = 50;

/// Scrollback history retained per session.
const HISTORY_LIMIT: u32 = 50_000;

/// Metadata for one tmux session.
#[derive(Debug, Clone)]
pub struct TmuxSession {
    pub name: String,
    pub created: String,
    pub attached: bool,
    pub width: u32,
    pub height: u32,
}

/// Run a tmux command with the standard timeout.
async fn run(args: &[&str]) -> Result<Output, TerminalError> {
    run_with_stdin(args, None).await
}

async fn run_with_stdin(args: &[&str], stdin: Option<&str>) -> Result<Output, TerminalError> {
    let mut cmd = Command::new("tmux");
    cmd.args(args);

    let result = if let Some(input) = stdin {
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        let mut child = cmd.spawn().map_err(spawn_error)?;
        if let Some(mut pipe) = child.stdin.take() {
            use tokio::io::AsyncWriteExt as _;
            if let Err(error) = pipe.write_all(input.as_bytes()).await {
                tracing::error!(%error, "failed to write tmux stdin");
                return Err(TerminalError::Io(error.to_string()));
            }
            // Close stdin so tmux sees EOF.
            drop(pipe);
        }
        tokio::time::timeout(TMUX_TIMEOUT, child.wait_with_output()).await
    } else {
        tokio::time::timeout(TMUX_TIMEOUT, cmd.output()).await
    };

    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(error)) => Err(spawn_error(error)),
        Err(_) => {
            tracing::error!(args = ?args, "tmux command timed out");
            Err(TerminalError::Timeout(args.join(" ")))
        }
    }
}

fn spawn_error(error: std::io::Error) -> TerminalError {
    if error.kind() == std::io::ErrorKind::NotFound {
        tracing::error!("tmux not found. Is it installed?");
        TerminalError::NotInstalled
    } else {
        tracing::error!(%error, "failed to run tmux");
        TerminalError::Io(error.to_string())
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// List all tmux sessions with metadata.
pub async fn list_sessions() -> Vec<TmuxSession> {
    let fmt = "#{session_name}|#{session_created}|#{session_attached}|#{session_width}|#{session_height}";
    let Ok(output) = run(&["list-sessions", "-F", fmt]).await else {
        return Vec::new();
    };
    if !output.status.success() {
        // No server running is the common case, not an error.
        return Vec::new();
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(parse_session_line)
        .collect()
}

fn parse_session_line(line: &str) -> Option<TmuxSession> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() != 5 {
        return None;
    }
    Some(TmuxSession {
        name: parts[0].to_string(),
        created: parts[1].to_string(),
        attached: parts[2] == "1",
        width: parts[3].parse().unwrap_or(80),
        height: parts[4].parse().unwrap_or(24),
    })
}

/// Check if a tmux session exists.
pub async fn session_exists(name: &str) -> bool {
    match run(&["has-session", "-t", name]).await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Create a new detached session running `command` in `working_dir`.
///
/// Sized to the wide geometry with a large scrollback buffer. The only
/// fallible-in-type primitive: spawn needs the failure detail for rollback
/// and the caller's error reply.
pub async fn create_session(
    name: &str,
    working_dir: &str,
    command: &str,
) -> Result<(), TerminalError> {
    let width = PANE_WIDTH.to_string();
    let height = PANE_HEIGHT.to_string();
    let output = run(&[
        "new-session",
        "-d",
        "-x",
        &width,
        "-y",
        &height,
        "-s",
        name,
        "-c",
        working_dir,
        command,
    ])
    .await?;

    if !output.status.success() {
        return Err(TerminalError::CreateFailed {
            name: name.to_string(),
            stderr: stderr_of(&output),
        });
    }

    let limit = HISTORY_LIMIT.to_string();
    let _ = run(&["set-option", "-t", name, "history-limit", &limit]).await;
    Ok(())
}

/// Kill a tmux session.
pub async fn kill_session(name: &str) -> bool {
    let Ok(output) = run(&["kill-session", "-t", name]).await else {
        return false;
    };
    if !output.status.success() {
        tracing::error!(session = %name, stderr = %stderr_of(&output), "failed to kill tmux session");
        return false;
    }
    true
}

/// Send text to a session, submitting it with a pair of Enters.
///
/// Single-line text goes through `send-keys` directly. Multi-line text is
/// loaded into the tmux paste buffer and pasted with bracketed-paste mode
/// (`paste-buffer -p`) so embedded newlines don't fire intermediate prompt
/// submissions in the agent TUI. The two Enters afterwards: the first closes
/// the input line, the second submits the prompt.
pub async fn send_keys(name: &str, text: &str) -> bool {
    send_keys_inner(name, text, true).await
}

/// Send text without the trailing Enter pair.
pub async fn send_keys_no_submit(name: &str, text: &str) -> bool {
    send_keys_inner(name, text, false).await
}

async fn send_keys_inner(name: &str, text: &str, submit: bool) -> bool {
    if text.contains('\n') {
        let Ok(load) = run_with_stdin(&["load-buffer", "-"], Some(text)).await else {
            return false;
        };
        if !load.status.success() {
            tracing::error!(session = %name, stderr = %stderr_of(&load), "failed to load tmux buffer");
            return false;
        }
        let Ok(paste) = run(&["paste-buffer", "-t", name, "-d", "-p"]).await else {
            return false;
        };
        if !paste.status.success() {
            tracing::error!(session = %name, stderr = %stderr_of(&paste), "failed to paste tmux buffer");
            return false;
        }
    } else {
        let Ok(output) = run(&["send-keys", "-t", name, text]).await else {
            return false;
        };
        if !output.status.success() {
            tracing::error!(session = %name, stderr = %stderr_of(&output), "failed to send keys");
            return false;
        }
    }

    if submit {
        let _ = run(&["send-keys", "-t", name, "Enter"]).await;
        let _ = run(&["send-keys", "-t", name, "Enter"]).await;
    }
    true
}

/// Send named keys ("Enter", "Escape", "Up", "Down", "C-c") with no implicit
/// submit. For interactive approval prompts.
pub async fn send_raw(name: &str, keys: &[&str]) -> bool {
    for key in keys {
        let Ok(output) = run(&["send-keys", "-t", name, key]).await else {
            return false;
        };
        if !output.status.success() {
            tracing::error!(session = %name, key = %key, stderr = %stderr_of(&output), "failed to send raw key");
            return false;
        }
    }
    true
}

/// Capture the last `lines` of rendered scrollback, preserving newlines.
pub async fn capture_pane(name: &str, lines: u32) -> String {
    let start = format!("-{lines}");
    let Ok(output) = run(&["capture-pane", "-t", name, "-p", "-e", "-S", &start]).await else {
        return String::new();
    };
    if !output.status.success() {
        tracing::error!(session = %name, stderr = %stderr_of(&output), "failed to capture pane");
        return String::new();
    }
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Resize a session window to the wide geometry.
pub async fn resize_window(name: &str) -> bool {
    let width = PANE_WIDTH.to_string();
    let height = PANE_HEIGHT.to_string();
    let Ok(output) = run(&["resize-window", "-t", name, "-x", &width, "-y", &height]).await
    else {
        return false;
    };
    if !output.status.success() {
        tracing::debug!(session = %name, stderr = %stderr_of(&output), "failed to resize window");
        return false;
    }
    true
}

/// Start mirroring every byte written to the pane into `log_path`.
pub async fn enable_pipe_pane(name: &str, log_path: &str) -> bool {
    let sink = format!("cat >> {log_path}");
    let Ok(output) = run(&["pipe-pane", "-t", name, "-o", &sink]).await else {
        return false;
    };
    if !output.status.success() {
        tracing::error!(session = %name, stderr = %stderr_of(&output), "failed to enable pipe-pane");
        return false;
    }
    true
}

/// Stop mirroring pane output (pipe-pane with no command).
pub async fn disable_pipe_pane(name: &str) -> bool {
    let Ok(output) = run(&["pipe-pane", "-t", name]).await else {
        return false;
    };
    if !output.status.success() {
        tracing::error!(session = %name, stderr = %stderr_of(&output), "failed to disable pipe-pane");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_session_listing_line() {
        let session = parse_session_line("forge__api__ab12cd|1735000000|0|250|50").unwrap();
        assert_eq!(session.name, "forge__api__ab12cd");
        assert!(!session.attached);
        assert_eq!(session.width, 250);
        assert_eq!(session.height, 50);
    }

    #[test]
    fn falls_back_on_bad_geometry() {
        let session = parse_session_line("main|123|1|wide|tall").unwrap();
        assert!(session.attached);
        assert_eq!(session.width, 80);
        assert_eq!(session.height, 24);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_session_line("just-a-name").is_none());
        assert!(parse_session_line("a|b|c").is_none());
        assert!(parse_session_line("").is_none());
    }
}
