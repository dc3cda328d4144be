//! Wrapper run loop: the child PTY, the local tty, and the relay pump.
//!
//! Blocking work (stdin reads, signal waits, PTY I/O) lives on dedicated
//! threads that feed channels; this loop multiplexes those channels and is
//! the only place that touches the relay connection. The child's bytes reach
//! local stdout and the relay in read order; relay INPUT and local stdin
//! reach the PTY in arrival order.

use anyhow::{anyhow, Context, Result};
use common::config::WrapperConfig;
use common::frame::{encode_resize, pack_frame, FRAME_TYPE_OUTPUT, FRAME_TYPE_RESIZE};
use common::pty::{pty_size, spawn_agent_pty};
use crossterm::terminal;
use signal_hook::consts::{SIGINT, SIGTERM, SIGWINCH};
use signal_hook::iterator::Signals;
use std::io::{IsTerminal, Read, Write};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::agent;
use crate::relay_client::{self, RelayConnection};

/// Exit code when the wrapper itself is interrupted.
const EXIT_INTERRUPTED: i32 = 130;

/// How long to wait for the child after asking it to go away.
const CHILD_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Restores the local terminal's cooked mode on every exit path.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        if !std::io::stdin().is_terminal() {
            return None;
        }
        match terminal::enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(err) => {
                log::warn!("could not enable raw mode: {err}");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// `(cols, rows)` of the hosting terminal, defaulting to 80x24.
fn terminal_size() -> (u16, u16) {
    terminal::size().unwrap_or((80, 24))
}

enum LoopEvent {
    PtyOutput(Option<bytes::Bytes>),
    RelayInput(Option<bytes::Bytes>),
    Stdin(Option<Vec<u8>>),
    Signal(Option<i32>),
    ChildExited(Option<u32>),
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Run the agent under a PTY, mirroring the terminal through the relay when
/// it is reachable. Returns the process exit code to propagate.
pub async fn run_agent(agent_name: &str, agent_args: &[String], config: WrapperConfig) -> Result<i32> {
    common::config::ensure_rustls_provider();

    let program = agent::locate_executable(agent_name)
        .ok_or_else(|| anyhow!("could not locate '{agent_name}' on PATH; install it or adjust PATH"))?;
    if config.api_key.is_none() {
        return Err(anyhow!("OMNARA_API_KEY is not set"));
    }

    let session_id = config
        .session_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // The relay is an augmentation, not a dependency: if it cannot be
    // reached the agent still runs locally.
    let relay = if config.relay_disabled {
        None
    } else {
        match relay_client::connect(&config, &session_id).await {
            Ok(connection) => Some(connection),
            Err(err) => {
                log::warn!("unable to reach relay: {err:#}");
                eprintln!("omnara: relay unavailable, continuing without session sharing");
                None
            }
        }
    };
    let (mut relay_out, mut relay_in) = match relay {
        Some(RelayConnection { outgoing, incoming }) => (Some(outgoing), Some(incoming)),
        None => (None, None),
    };

    let (cols, rows) = terminal_size();
    let cmd = agent::build_agent_command(&program, agent_args, &config, &session_id);
    let mut pty = spawn_agent_pty(cmd, pty_size(cols, rows))
        .context("failed to start the agent under a PTY")?;

    // Announce the initial window size before any output flows.
    if let Some(out) = &relay_out {
        let _ = out.try_send(pack_frame(FRAME_TYPE_RESIZE, &encode_resize(rows, cols)));
    }

    let raw_guard = RawModeGuard::enable();

    // Local keystrokes go to the PTY only; the relay sees their effect
    // through PTY echo.
    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 8192];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    let mut stdin_rx = Some(stdin_rx);

    let (signal_tx, signal_rx) = mpsc::channel::<i32>(16);
    let mut signals =
        Signals::new([SIGWINCH, SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    let signals_handle = signals.handle();
    std::thread::spawn(move || {
        for signal in signals.forever() {
            if signal_tx.blocking_send(signal).is_err() {
                break;
            }
        }
    });
    let mut signal_rx = Some(signal_rx);

    let mut stdout = std::io::stdout();
    let mut exit_code: Option<i32> = None;
    let mut interrupted = false;

    loop {
        let event = tokio::select! {
            chunk = pty.output_rx.recv() => LoopEvent::PtyOutput(chunk),
            payload = recv_opt(&mut relay_in) => LoopEvent::RelayInput(payload),
            data = recv_opt(&mut stdin_rx) => LoopEvent::Stdin(data),
            signal = recv_opt(&mut signal_rx) => LoopEvent::Signal(signal),
            code = pty.exit_rx.recv() => LoopEvent::ChildExited(code),
        };

        match event {
            LoopEvent::PtyOutput(Some(chunk)) => {
                if stdout.write_all(&chunk).and_then(|()| stdout.flush()).is_err() {
                    log::warn!("local stdout write failed");
                }
                if let Some(out) = &relay_out {
                    let frame = pack_frame(FRAME_TYPE_OUTPUT, &chunk);
                    if out.send(frame).await.is_err() {
                        log::warn!("relay send failed, continuing locally");
                        relay_out = None;
                        relay_in = None;
                    }
                }
            }
            // PTY closed: the child is gone or going.
            LoopEvent::PtyOutput(None) => break,
            LoopEvent::RelayInput(Some(payload)) => {
                let _ = pty.input_tx.send(payload.to_vec());
            }
            LoopEvent::RelayInput(None) => {
                log::warn!("relay connection closed, continuing locally");
                relay_out = None;
                relay_in = None;
            }
            LoopEvent::Stdin(Some(data)) => {
                let _ = pty.input_tx.send(data);
            }
            LoopEvent::Stdin(None) => stdin_rx = None,
            LoopEvent::Signal(Some(SIGWINCH)) => {
                let (cols, rows) = terminal_size();
                let _ = pty.resize_tx.send((cols, rows));
                if let Some(out) = &relay_out {
                    let _ = out.try_send(pack_frame(FRAME_TYPE_RESIZE, &encode_resize(rows, cols)));
                }
            }
            LoopEvent::Signal(Some(_)) => {
                interrupted = true;
                break;
            }
            LoopEvent::Signal(None) => signal_rx = None,
            LoopEvent::ChildExited(code) => {
                exit_code = code.map(|code| code as i32);
                break;
            }
        }
    }

    // Cooked mode back before anything else writes to the terminal.
    drop(raw_guard);
    signals_handle.close();
    drop(relay_out);

    if interrupted {
        let _ = pty.bridge.kill();
        let _ = tokio::time::timeout(CHILD_REAP_TIMEOUT, pty.exit_rx.recv()).await;
        return Ok(EXIT_INTERRUPTED);
    }

    if exit_code.is_none() {
        // PTY EOF usually precedes the exit notification by a moment.
        exit_code = tokio::time::timeout(CHILD_REAP_TIMEOUT, pty.exit_rx.recv())
            .await
            .ok()
            .flatten()
            .map(|code| code as i32);
    }
    if exit_code.is_none() {
        let _ = pty.bridge.kill();
        exit_code = tokio::time::timeout(CHILD_REAP_TIMEOUT, pty.exit_rx.recv())
            .await
            .ok()
            .flatten()
            .map(|code| code as i32);
    }

    Ok(exit_code.unwrap_or(1))
}
