//! Control messages between the host and the sandbox, framed with bincode.

use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::bridge::ring::SharedRingDescriptor;
use crate::descriptor::PluginDescriptor;
use crate::error::BridgeError;

/// Bumped whenever a message layout changes.
pub const BRIDGE_PROTOCOL: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeCommand {
    Hello { protocol: u32 },
    Load {
        descriptor: PluginDescriptor,
        ring: SharedRingDescriptor,
    },
    Activate { sample_rate: u32, max_block: u32 },
    Deactivate,
    SaveState,
    RestoreState { blob: Vec<u8> },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeEvent {
    Ready { protocol: u32 },
    Loaded { latency: u32 },
    Activated { latency: u32 },
    Deactivated,
    State { blob: Vec<u8> },
    /// Parameter values after a restore, in descriptor order.
    Restored { params: Vec<f32> },
    Unsavable,
    Failed { message: String },
    Bye,
}

/// A command tagged with the id its reply will carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u64,
    pub command: BridgeCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReply {
    pub id: u64,
    pub event: BridgeEvent,
}

/// Bidirectional transport over a pair of byte streams, usually pipes.
#[derive(Debug)]
pub struct IpcTransport<R, W>
where
    R: Read,
    W: Write,
{
    reader: Arc<parking_lot::Mutex<BufReader<R>>>,
    writer: Arc<parking_lot::Mutex<BufWriter<W>>>,
}

impl<R, W> Clone for IpcTransport<R, W>
where
    R: Read,
    W: Write,
{
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<R, W> IpcTransport<R, W>
where
    R: Read,
    W: Write,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Arc::new(parking_lot::Mutex::new(BufReader::new(reader))),
            writer: Arc::new(parking_lot::Mutex::new(BufWriter::new(writer))),
        }
    }

    pub fn send<T: Serialize>(&self, value: &T) -> Result<(), BridgeError> {
        let mut writer = self.writer.lock();
        bincode::serialize_into(&mut *writer, value)?;
        writer.flush()?;
        Ok(())
    }

    /// Blocks until a full message arrives. A closed stream maps to
    /// [`BridgeError::Disconnected`].
    pub fn recv<T: DeserializeOwned>(&self) -> Result<T, BridgeError> {
        let mut reader = self.reader.lock();
        bincode::deserialize_from(&mut *reader).map_err(|err| {
            let closed = matches!(
                &*err,
                bincode::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof
            );
            if closed {
                BridgeError::Disconnected
            } else {
                BridgeError::Codec(err)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_cross_a_pipe() {
        let (host_read, sandbox_write) = os_pipe::pipe().unwrap();
        let (sandbox_read, host_write) = os_pipe::pipe().unwrap();
        let host = IpcTransport::new(host_read, host_write);
        let sandbox = IpcTransport::new(sandbox_read, sandbox_write);

        let request = BridgeRequest {
            id: 7,
            command: BridgeCommand::RestoreState {
                blob: vec![1, 2, 3],
            },
        };
        host.send(&request).unwrap();
        let received: BridgeRequest = sandbox.recv().unwrap();
        assert_eq!(received, request);

        sandbox
            .send(&BridgeReply {
                id: 7,
                event: BridgeEvent::Restored { params: vec![0.25, 1.0] },
            })
            .unwrap();
        let reply: BridgeReply = host.recv().unwrap();
        assert_eq!(reply.event, BridgeEvent::Restored { params: vec![0.25, 1.0] });
    }

    #[test]
    fn closed_pipe_reports_disconnect() {
        let (reader, writer) = os_pipe::pipe().unwrap();
        let (_unused_reader, sink) = os_pipe::pipe().unwrap();
        drop(writer);
        let transport = IpcTransport::new(reader, sink);
        assert!(matches!(
            transport.recv::<BridgeReply>(),
            Err(BridgeError::Disconnected)
        ));
    }
}
