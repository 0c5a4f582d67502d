use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Terminal emulators the launcher knows how to drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TerminalKind {
    /// macOS Terminal.app, driven through AppleScript.
    Terminal,
    Iterm,
    Alacritty,
    GnomeTerminal,
    Konsole,
    Xterm,
    WindowsTerminal,
    Cmd,
    Powershell,
}

impl TerminalKind {
    /// The executable probed on PATH to decide availability.
    pub fn program(self) -> &'static str {
        match self {
            Self::Terminal | Self::Iterm => "osascript",
            Self::Alacritty => "alacritty",
            Self::GnomeTerminal => "gnome-terminal",
            Self::Konsole => "konsole",
            Self::Xterm => "xterm",
            Self::WindowsTerminal => "wt",
            Self::Cmd => "cmd",
            Self::Powershell => "powershell",
        }
    }

    pub fn is_available(self) -> bool {
        find_in_path(self.program()).is_some()
    }
}

/// OS-specific preference order used when no terminal is requested.
fn default_candidates() -> &'static [TerminalKind] {
    #[cfg(target_os = "macos")]
    {
        &[
            TerminalKind::Terminal,
            TerminalKind::Iterm,
            TerminalKind::Alacritty,
        ]
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        &[
            TerminalKind::GnomeTerminal,
            TerminalKind::Konsole,
            TerminalKind::Xterm,
            TerminalKind::Alacritty,
        ]
    }
    #[cfg(windows)]
    {
        &[
            TerminalKind::WindowsTerminal,
            TerminalKind::Cmd,
            TerminalKind::Powershell,
        ]
    }
}

/// Picks the terminal to launch: the preferred kind when given, otherwise
/// the first available emulator in the OS preference order.
pub fn detect_terminal(preferred: Option<TerminalKind>) -> Option<TerminalKind> {
    if preferred.is_some() {
        return preferred;
    }
    default_candidates()
        .iter()
        .copied()
        .find(|kind| kind.is_available())
}

/// Brings the emulator's window to the foreground. Best effort only.
pub fn focus_terminal_window(kind: TerminalKind) -> Result<()> {
    #[cfg(target_os = "macos")]
    {
        let app = match kind {
            TerminalKind::Iterm => "iTerm",
            TerminalKind::Alacritty => "Alacritty",
            _ => "Terminal",
        };
        std::process::Command::new("osascript")
            .arg("-e")
            .arg(format!("tell application \"{app}\" to activate"))
            .status()
            .context("failed to run osascript")?;
        return Ok(());
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        let class = match kind {
            TerminalKind::Konsole => "konsole",
            TerminalKind::Xterm => "xterm",
            TerminalKind::Alacritty => "Alacritty",
            _ => "gnome-terminal",
        };
        // wmctrl is optional; a missing binary is not an error worth surfacing.
        let _ = std::process::Command::new("wmctrl")
            .arg("-xa")
            .arg(class)
            .status();
        return Ok(());
    }
    #[cfg(windows)]
    {
        let _ = kind;
        Ok(())
    }
}

/// What to run inside the spawned terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub terminal: TerminalKind,
    pub working_directory: PathBuf,
    /// Shell command line starting the interactive tool.
    pub command: String,
    /// Used to name the PID hand-off file.
    pub session_id: String,
}

/// Seam over terminal spawning so session tests substitute a stub that
/// spawns a plain child process.
#[async_trait]
pub trait TerminalLauncher: Send + Sync {
    /// Spawns a detached terminal and returns the PID to monitor.
    async fn launch(&self, request: &LaunchRequest) -> Result<u32>;
}

/// Launches real terminal emulators. On Unix the tool is wrapped in a
/// generated shell script that records its own PID to a file, so the
/// monitored PID is the tool shell rather than the emulator process.
#[derive(Debug, Default)]
pub struct SystemTerminalLauncher;

#[async_trait]
impl TerminalLauncher for SystemTerminalLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<u32> {
        #[cfg(unix)]
        {
            launch_unix(request).await
        }
        #[cfg(windows)]
        {
            launch_windows(request).await
        }
    }
}

/// Builds the emulator invocation for a prepared wrapper script.
pub fn spawn_invocation(kind: TerminalKind, script_path: &Path) -> (String, Vec<String>) {
    let script = script_path.display().to_string();
    match kind {
        TerminalKind::Terminal => (
            "osascript".to_string(),
            vec![
                "-e".to_string(),
                format!("tell application \"Terminal\" to do script \"sh {script}\""),
                "-e".to_string(),
                "tell application \"Terminal\" to activate".to_string(),
            ],
        ),
        TerminalKind::Iterm => (
            "osascript".to_string(),
            vec![
                "-e".to_string(),
                format!(
                    "tell application \"iTerm\" to create window with default profile command \"sh {script}\""
                ),
            ],
        ),
        TerminalKind::Alacritty => (
            "alacritty".to_string(),
            vec!["-e".to_string(), "sh".to_string(), script],
        ),
        TerminalKind::GnomeTerminal => (
            "gnome-terminal".to_string(),
            vec!["--".to_string(), "sh".to_string(), script],
        ),
        TerminalKind::Konsole => (
            "konsole".to_string(),
            vec!["-e".to_string(), "sh".to_string(), script],
        ),
        TerminalKind::Xterm => (
            "xterm".to_string(),
            vec!["-e".to_string(), "sh".to_string(), script],
        ),
        TerminalKind::WindowsTerminal => (
            "wt".to_string(),
            vec!["cmd".to_string(), "/K".to_string(), script],
        ),
        TerminalKind::Cmd => (
            "cmd".to_string(),
            vec![
                "/C".to_string(),
                "start".to_string(),
                "cmd".to_string(),
                "/K".to_string(),
                script,
            ],
        ),
        TerminalKind::Powershell => (
            "powershell".to_string(),
            vec![
                "-NoExit".to_string(),
                "-Command".to_string(),
                format!("& '{script}'"),
            ],
        ),
    }
}

/// Wraps text in single quotes for POSIX shells.
pub fn shell_escape(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

#[cfg(unix)]
async fn launch_unix(request: &LaunchRequest) -> Result<u32> {
    use std::os::unix::fs::PermissionsExt;

    let pid_file = std::env::temp_dir().join(format!("relay-session-{}.pid", request.session_id));
    let script_file = std::env::temp_dir().join(format!("relay-session-{}.sh", request.session_id));
    let _ = std::fs::remove_file(&pid_file);

    // The script records its own PID, runs the tool, and cleans up after
    // itself so stale files never accumulate.
    let script = format!(
        "#!/bin/sh\ncd {cwd}\necho $$ > {pid}\n{command}\nrm -f {pid}\nrm -f {script}\n",
        cwd = shell_escape(&request.working_directory.display().to_string()),
        pid = shell_escape(&pid_file.display().to_string()),
        command = request.command,
        script = shell_escape(&script_file.display().to_string()),
    );
    std::fs::write(&script_file, script)
        .with_context(|| format!("failed to write {}", script_file.display()))?;
    let mut perms = std::fs::metadata(&script_file)
        .with_context(|| format!("failed to stat {}", script_file.display()))?
        .permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script_file, perms)
        .with_context(|| format!("failed to chmod {}", script_file.display()))?;

    let (program, args) = spawn_invocation(request.terminal, &script_file);
    let child = tokio::process::Command::new(&program)
        .args(&args)
        .spawn()
        .with_context(|| format!("failed to spawn terminal '{program}'"))?;
    let emulator_pid = child.id();
    debug!(
        terminal = request.terminal.program(),
        session = request.session_id.as_str(),
        "terminal spawned"
    );

    // Prefer the wrapper shell's PID from the hand-off file; some
    // emulators fork away from the process we spawned.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(raw) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                return Ok(pid);
            }
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match emulator_pid {
        Some(pid) => Ok(pid),
        None => bail!("terminal spawned but no PID could be determined"),
    }
}

#[cfg(windows)]
async fn launch_windows(request: &LaunchRequest) -> Result<u32> {
    let script_file = std::env::temp_dir().join(format!("relay-session-{}.cmd", request.session_id));
    let script = format!(
        "@echo off\r\ncd /d \"{}\"\r\n{}\r\n",
        request.working_directory.display(),
        request.command
    );
    std::fs::write(&script_file, script)
        .with_context(|| format!("failed to write {}", script_file.display()))?;

    let (program, args) = spawn_invocation(request.terminal, &script_file);
    let child = tokio::process::Command::new(&program)
        .args(&args)
        .spawn()
        .with_context(|| format!("failed to spawn terminal '{program}'"))?;
    child
        .id()
        .context("terminal spawned but no PID could be determined")
}

fn find_in_path(program: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let with_exe = dir.join(format!("{program}.exe"));
            if with_exe.is_file() {
                return Some(with_exe);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_shell_escape_handles_embedded_quotes() {
        assert_eq!(shell_escape("plain"), "'plain'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn unit_spawn_invocation_templates_cover_every_kind() {
        let script = Path::new("/tmp/session.sh");
        let (program, args) = spawn_invocation(TerminalKind::GnomeTerminal, script);
        assert_eq!(program, "gnome-terminal");
        assert_eq!(args, vec!["--", "sh", "/tmp/session.sh"]);

        let (program, args) = spawn_invocation(TerminalKind::Terminal, script);
        assert_eq!(program, "osascript");
        assert!(args[1].contains("do script"));

        let (program, _args) = spawn_invocation(TerminalKind::WindowsTerminal, script);
        assert_eq!(program, "wt");
    }

    #[test]
    fn unit_detect_terminal_honors_explicit_preference() {
        assert_eq!(
            detect_terminal(Some(TerminalKind::Xterm)),
            Some(TerminalKind::Xterm)
        );
    }

    #[test]
    fn unit_terminal_kind_round_trips_kebab_case() {
        let encoded = serde_json::to_string(&TerminalKind::GnomeTerminal).expect("encode");
        assert_eq!(encoded, "\"gnome-terminal\"");
        let decoded: TerminalKind = serde_json::from_str("\"windows-terminal\"").expect("decode");
        assert_eq!(decoded, TerminalKind::WindowsTerminal);
    }
}
