//! Portable PTY bridge for the wrapper: spawn the agent CLI under a PTY and
//! expose its I/O as channels.
//!
//! Blocking PTY work runs on dedicated threads (reader, writer, resizer,
//! exit poller); the wrapper's async control loop talks to them through
//! channels only, so there is no shared mutable session state.

use anyhow::{Context, Result};
use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::{self, Arc, Mutex};
use tokio::sync::mpsc;

/// Input is written to the PTY master in chunks of at most this many bytes,
/// so a huge paste cannot wedge the master behind one write.
pub const PTY_WRITE_CHUNK: usize = 1024;

/// PTY read buffer size.
const PTY_READ_BUF: usize = 8192;

/// Interval between `try_wait` polls on the child.
const EXIT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// Build a [`PtySize`] with unspecified pixel dimensions.
pub fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Handle on the PTY child used for teardown.
pub struct PtyBridge {
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
}

impl PtyBridge {
    /// Kill the child process. Used when the wrapper is torn down before the
    /// child has exited on its own.
    pub fn kill(&self) -> std::io::Result<()> {
        let mut guard = self
            .child
            .lock()
            .map_err(|_| std::io::Error::other("child mutex poisoned"))?;
        guard.kill()
    }
}

/// Channels out of [`spawn_agent_pty`].
pub struct PtySpawn {
    /// Terminal output read from the PTY master, in read order.
    pub output_rx: mpsc::Receiver<Bytes>,
    /// Bytes to write to the PTY master (keystrokes from any source).
    pub input_tx: sync::mpsc::Sender<Vec<u8>>,
    /// Resize requests `(cols, rows)` applied to the master.
    pub resize_tx: sync::mpsc::Sender<(u16, u16)>,
    /// Child exit code, delivered once.
    pub exit_rx: mpsc::Receiver<u32>,
    pub bridge: PtyBridge,
}

/// Spawn `cmd` under a new PTY of the given size.
pub fn spawn_agent_pty(cmd: CommandBuilder, size: PtySize) -> Result<PtySpawn> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(size).context("failed to open PTY")?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .context("failed to spawn agent under PTY")?;

    let mut reader = pair
        .master
        .try_clone_reader()
        .context("failed to clone PTY reader")?;
    let mut writer = pair.master.take_writer().context("failed to take PTY writer")?;
    let master = pair.master;

    let (output_tx, output_rx) = mpsc::channel::<Bytes>(256);
    let (input_tx, input_rx) = sync::mpsc::channel::<Vec<u8>>();
    let (resize_tx, resize_rx) = sync::mpsc::channel::<(u16, u16)>();
    let (exit_tx, exit_rx) = mpsc::channel::<u32>(1);

    let child = Arc::new(Mutex::new(child));

    // Blocking reader: PTY master -> async side. Blocks (and therefore
    // backpressures the child through the PTY) when the consumer stalls.
    std::thread::spawn(move || {
        let mut buf = [0u8; PTY_READ_BUF];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // Single writer: all input sources funnel through one queue, written in
    // bounded chunks so ordering is exactly queue order.
    std::thread::spawn(move || {
        while let Ok(data) = input_rx.recv() {
            if write_chunked(&mut writer, &data).is_err() {
                break;
            }
        }
    });

    // Resize executor owns the master fd.
    std::thread::spawn(move || {
        while let Ok((cols, rows)) = resize_rx.recv() {
            let _ = master.resize(pty_size(cols, rows));
        }
    });

    // Exit poller: try_wait until the child is gone, then report the code.
    let child_poll = Arc::clone(&child);
    std::thread::spawn(move || loop {
        let status = {
            let mut guard = match child_poll.lock() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            match guard.try_wait() {
                Ok(None) => None,
                Ok(Some(status)) => Some(status.exit_code()),
                Err(_) => break,
            }
        };
        if let Some(code) = status {
            let _ = exit_tx.blocking_send(code);
            break;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    });

    Ok(PtySpawn {
        output_rx,
        input_tx,
        resize_tx,
        exit_rx,
        bridge: PtyBridge { child },
    })
}

/// Write `data` in [`PTY_WRITE_CHUNK`]-sized pieces, flushing after each.
fn write_chunked(writer: &mut (impl Write + ?Sized), data: &[u8]) -> std::io::Result<()> {
    for chunk in data.chunks(PTY_WRITE_CHUNK) {
        writer.write_all(chunk)?;
        writer.flush()?;
    }
    Ok(())
}
