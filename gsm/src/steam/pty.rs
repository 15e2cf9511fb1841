//! Pseudo-terminal plumbing for the content tool.
//!
//! The tool only produces usable progress output on a terminal; on a plain
//! pipe the `\r`-terminated progress lines never arrive. The child is
//! therefore spawned on a PTY, and a dedicated reader thread splits the
//! byte stream into `\r\n`-terminated lines (empties skipped) and finally
//! reaps the exit status.

use std::io::Read;

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::SteamError;

/// Events produced by a PTY child.
#[derive(Debug)]
pub enum PtyEvent {
    /// One non-empty output line (without the `\r\n` terminator).
    Line(String),
    /// The child exited. `code` is `None` when no code could be read.
    Exit { code: Option<u32> },
}

/// A child process running on a pseudo-terminal.
pub struct PtyChild {
    pid: Option<u32>,
    events: mpsc::UnboundedReceiver<PtyEvent>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    // Held so the PTY stays open until the child is done.
    _master: Box<dyn MasterPty + Send>,
}

impl PtyChild {
    /// Spawn `cmd` on a fresh PTY.
    pub fn spawn(cmd: CommandBuilder) -> Result<Self, SteamError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SteamError::Pty(format!("failed to open PTY: {e}")))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SteamError::Pty(format!("failed to spawn on PTY: {e}")))?;
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SteamError::Pty(format!("failed to clone PTY reader: {e}")))?;

        let (tx, events) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("gsm-pty-reader".to_string())
            .spawn(move || read_loop(reader, child, tx))
            .map_err(|e| SteamError::Pty(format!("failed to spawn reader thread: {e}")))?;

        debug!(?pid, "PTY child spawned");
        Ok(Self {
            pid,
            events,
            killer,
            _master: pair.master,
        })
    }

    /// PID of the child, when known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Next event; `None` after `Exit` has been delivered.
    pub async fn next_event(&mut self) -> Option<PtyEvent> {
        self.events.recv().await
    }

    /// Ask the child to stop (SIGTERM), leaving it time to clean up.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            debug!(pid, "SIGTERM to PTY child");
            // SAFETY: plain kill(2) with SIGTERM.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    /// Hard-kill the child.
    pub fn kill(&mut self) {
        let _ = self.killer.kill();
    }
}

fn read_loop(
    mut reader: Box<dyn std::io::Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    tx: mpsc::UnboundedSender<PtyEvent>,
) {
    let mut buffer = String::new();
    let mut bytes = [0u8; 4096];
    loop {
        match reader.read(&mut bytes) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                buffer.push_str(&String::from_utf8_lossy(&bytes[..n]));
                while let Some(pos) = buffer.find("\r\n") {
                    let line = buffer[..pos].to_string();
                    buffer.drain(..pos + 2);
                    if line.is_empty() {
                        continue;
                    }
                    trace!(line = %line, "pty line");
                    if tx.send(PtyEvent::Line(line)).is_err() {
                        return;
                    }
                }
            }
        }
    }

    let code = child.wait().ok().map(|status| status.exit_code());
    let _ = tx.send(PtyEvent::Exit { code });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.arg("-c");
        cmd.arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_lines_and_exit_code() {
        let mut child =
            PtyChild::spawn(sh("printf 'hello\\r\\n\\r\\nworld\\r\\n'; exit 7")).unwrap();

        let mut lines = Vec::new();
        let code = loop {
            match child.next_event().await {
                Some(PtyEvent::Line(line)) => lines.push(line),
                Some(PtyEvent::Exit { code }) => break code,
                None => break None,
            }
        };

        // The empty line between hello and world is skipped.
        assert_eq!(lines, vec!["hello".to_string(), "world".to_string()]);
        assert_eq!(code, Some(7));
    }

    #[tokio::test]
    async fn test_terminate_interrupts_sleep() {
        let mut child = PtyChild::spawn(sh("sleep 30")).unwrap();
        assert!(child.pid().is_some());

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        child.terminate();

        let code = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match child.next_event().await {
                    Some(PtyEvent::Exit { code }) => break code,
                    Some(_) => continue,
                    None => break None,
                }
            }
        })
        .await
        .expect("child should exit promptly after SIGTERM");

        // Killed by signal: any nonzero/absent code is acceptable, the
        // point is that it exited well inside the cancel budget.
        assert_ne!(code, Some(0));
    }
}
