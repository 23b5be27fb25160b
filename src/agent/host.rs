//! Agent Process Host (§4.3): one interactive agent CLI session attached to
//! a pseudo-terminal, kept alive across many rounds of a milestone.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, warn};

use crate::error::{AnimaError, Result};

/// Liveness snapshot of a session (§4.3: `health()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Alive,
    Exited(Option<i32>),
}

/// One role's (developer or acceptor) agent session, bound to a project's
/// working tree for the lifetime of a milestone.
pub struct AgentProcessHost {
    /// Raw output chunks (stdout/stderr merged by the PTY). Bounded so a
    /// stalled consumer applies backpressure rather than buffering forever.
    pub output: flume::Receiver<Vec<u8>>,
    input: flume::Sender<Vec<u8>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    _reader_thread: Option<std::thread::JoinHandle<()>>,
    _writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl AgentProcessHost {
    /// Spawn `command` (with `args`) inside a fresh PTY rooted at
    /// `working_dir`. One host per role per active milestone (§4.3 caps
    /// this at two per milestone; enforcement lives in the Iteration
    /// Engine, which owns at most one host per role at a time).
    pub fn spawn(command: &str, args: &[&str], working_dir: &Path) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 40,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AnimaError::FatalEngine(format!("pty open failed: {e}")))?;

        let mut builder = CommandBuilder::new(command);
        for arg in args {
            builder.arg(*arg);
        }
        builder.cwd(working_dir);

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| AnimaError::FatalEngine(format!("agent spawn failed: {e}")))?;
        drop(pair.slave);

        let child = Arc::new(Mutex::new(child));

        let (output_tx, output_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| AnimaError::FatalEngine(format!("pty reader clone failed: {e}")))?;
        let reader_thread = std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("agent pty reader stopped: {e}");
                        break;
                    }
                }
            }
        });

        let (input_tx, input_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| AnimaError::FatalEngine(format!("pty writer take failed: {e}")))?;
        let writer_thread = std::thread::spawn(move || {
            use std::io::Write;
            while let Ok(data) = input_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(Self {
            output: output_rx,
            input: input_tx,
            child,
            _reader_thread: Some(reader_thread),
            _writer_thread: Some(writer_thread),
        })
    }

    /// Write a frame to the child's standard input. Fails with
    /// `kind=transient_agent` if the session is already dead (§4.3).
    pub fn send(&self, frame: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(AnimaError::TransientAgent("session dead on send".into()));
        }
        self.input
            .send(frame.to_vec())
            .map_err(|_| AnimaError::TransientAgent("input channel closed".into()))
    }

    pub fn send_line(&self, line: &str) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.send(&data)
    }

    pub fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("agent child lock poisoned, recovering");
            e.into_inner()
        });
        matches!(child.try_wait(), Ok(None))
    }

    pub fn health(&self) -> Health {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("agent child lock poisoned, recovering");
            e.into_inner()
        });
        match child.try_wait() {
            Ok(None) => Health::Alive,
            Ok(Some(status)) => Health::Exited(status.exit_code().try_into().ok()),
            Err(_) => Health::Exited(None),
        }
    }

    /// Forced termination. Zombie reaping is guaranteed before return
    /// (§4.3): `wait()` is called after `kill()` on a blocking thread.
    pub async fn kill(self) -> Result<()> {
        let child = self.child.clone();
        tokio::task::spawn_blocking(move || {
            let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
            let _ = child.kill();
            let _ = child.wait();
        })
        .await
        .map_err(|e| AnimaError::FatalEngine(e.to_string()))?;
        Ok(())
    }

    /// Graceful shutdown: give the process a grace period to exit on its
    /// own (e.g. after sending an EOF/quit directive), then force-kill.
    pub async fn close(self, grace: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if !self.is_alive() {
                let child = self.child.clone();
                tokio::task::spawn_blocking(move || {
                    let mut child = child.lock().unwrap_or_else(|e| e.into_inner());
                    let _ = child.wait();
                })
                .await
                .map_err(|e| AnimaError::FatalEngine(e.to_string()))?;
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return self.kill().await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
