//! Request/reply channel to a sandbox.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use os_pipe::{PipeReader, PipeWriter};

use crate::bridge::ipc::{
    BridgeCommand, BridgeEvent, BridgeReply, BridgeRequest, IpcTransport, BRIDGE_PROTOCOL,
};
use crate::bridge::server;
use crate::error::BridgeError;
use crate::native::NativeRegistry;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Control-plane access to a sandbox. Only the control thread calls this.
pub trait SandboxBroker: Send {
    /// Sends `command` and waits for its reply. `Failed` replies come back as
    /// [`BridgeError::Remote`].
    fn request(&mut self, command: BridgeCommand, timeout: Duration) -> Result<BridgeEvent, BridgeError>;

    fn is_alive(&mut self) -> bool;

    fn shutdown(&mut self) -> Result<(), BridgeError>;
}

enum Endpoint {
    Process(Child),
    Thread(Option<JoinHandle<Result<(), BridgeError>>>),
}

/// Broker over a pair of pipes, to a child process or a local thread.
pub struct PipeBroker<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    transport: IpcTransport<R, W>,
    replies: Receiver<BridgeReply>,
    endpoint: Endpoint,
    next_id: u64,
    closed: bool,
    _reader: JoinHandle<()>,
}

impl PipeBroker<ChildStdout, ChildStdin> {
    pub fn spawn_process(executable: &Path, timeout: Duration) -> Result<Self, BridgeError> {
        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| BridgeError::Spawn(format!("{}: {err}", executable.display())))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Spawn("sandbox stdout not captured".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Spawn("sandbox stdin not captured".into()))?;
        tracing::debug!(?executable, "spawned plugin sandbox");
        Self::connect(
            IpcTransport::new(stdout, stdin),
            Endpoint::Process(child),
            timeout,
        )
    }
}

impl PipeBroker<PipeReader, PipeWriter> {
    pub fn spawn_thread(registry: Arc<NativeRegistry>, timeout: Duration) -> Result<Self, BridgeError> {
        let (host_read, sandbox_write) = os_pipe::pipe()?;
        let (sandbox_read, host_write) = os_pipe::pipe()?;
        let handle = thread::Builder::new()
            .name("cadenza-sandbox".into())
            .spawn(move || server::serve(sandbox_read, sandbox_write, registry))?;
        Self::connect(
            IpcTransport::new(host_read, host_write),
            Endpoint::Thread(Some(handle)),
            timeout,
        )
    }
}

impl<R, W> PipeBroker<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn connect(
        transport: IpcTransport<R, W>,
        endpoint: Endpoint,
        timeout: Duration,
    ) -> Result<Self, BridgeError> {
        let (reply_tx, replies) = crossbeam_channel::unbounded();
        let reader = transport.clone();
        let reader_thread = thread::Builder::new()
            .name("cadenza-sandbox-reader".into())
            .spawn(move || loop {
                match reader.recv::<BridgeReply>() {
                    Ok(reply) => {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(BridgeError::Disconnected) => break,
                    Err(err) => {
                        tracing::warn!(%err, "dropping sandbox connection");
                        break;
                    }
                }
            })?;
        let mut broker = Self {
            transport,
            replies,
            endpoint,
            next_id: 1,
            closed: false,
            _reader: reader_thread,
        };
        match broker.request(
            BridgeCommand::Hello {
                protocol: BRIDGE_PROTOCOL,
            },
            timeout,
        )? {
            BridgeEvent::Ready { protocol } if protocol == BRIDGE_PROTOCOL => Ok(broker),
            other => {
                let _ = broker.shutdown();
                Err(BridgeError::Protocol(format!("handshake answered with {other:?}")))
            }
        }
    }
}

impl<R, W> SandboxBroker for PipeBroker<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn request(&mut self, command: BridgeCommand, timeout: Duration) -> Result<BridgeEvent, BridgeError> {
        if self.closed {
            return Err(BridgeError::Disconnected);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.transport.send(&BridgeRequest { id, command })?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(remaining) {
                Ok(reply) if reply.id == id => {
                    return match reply.event {
                        BridgeEvent::Failed { message } => Err(BridgeError::Remote(message)),
                        event => Ok(event),
                    };
                }
                Ok(stale) => tracing::debug!(id = stale.id, "discarding stale sandbox reply"),
                Err(RecvTimeoutError::Timeout) => return Err(BridgeError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Err(BridgeError::Disconnected),
            }
        }
    }

    fn is_alive(&mut self) -> bool {
        if self.closed {
            return false;
        }
        match &mut self.endpoint {
            Endpoint::Process(child) => matches!(child.try_wait(), Ok(None)),
            Endpoint::Thread(handle) => handle.as_ref().is_some_and(|h| !h.is_finished()),
        }
    }

    fn shutdown(&mut self) -> Result<(), BridgeError> {
        if self.closed {
            return Ok(());
        }
        if let Err(err) = self.request(BridgeCommand::Shutdown, SHUTDOWN_GRACE) {
            tracing::debug!(%err, "sandbox did not acknowledge shutdown");
        }
        self.closed = true;
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        match &mut self.endpoint {
            Endpoint::Process(child) => loop {
                match child.try_wait()? {
                    Some(status) if status.success() => return Ok(()),
                    Some(status) => {
                        return Err(BridgeError::Remote(format!("sandbox exited with {status}")))
                    }
                    None if Instant::now() >= deadline => {
                        tracing::warn!("killing unresponsive plugin sandbox");
                        child.kill()?;
                        child.wait()?;
                        return Ok(());
                    }
                    None => thread::sleep(Duration::from_millis(5)),
                }
            },
            Endpoint::Thread(handle) => {
                while handle.as_ref().is_some_and(|h| !h.is_finished()) {
                    if Instant::now() >= deadline {
                        tracing::warn!("leaving unresponsive sandbox thread behind");
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                match handle.take().map(JoinHandle::join) {
                    Some(Ok(result)) => result,
                    Some(Err(_)) => Err(BridgeError::Remote("sandbox thread panicked".into())),
                    None => Ok(()),
                }
            }
        }
    }
}

impl<R, W> Drop for PipeBroker<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::debug!(%err, "sandbox shutdown failed");
        }
    }
}
