//! TCP channel
//!
//! Emulates one-sided remote writes over a TCP stream.
//!
//! Each end runs a pump thread that applies incoming frames to local
//! memory in arrival order. Because the stream is ordered, a SIGNAL frame
//! is applied only after every MESSAGE/REGION frame sent before it, which
//! is the visibility guarantee the handshake relies on.

use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;

use super::{Channel, Mailbox};
use crate::arena::ChunkArena;
use crate::error::{Result, StageError};
use crate::protocol::{read_frame, write_frame, Frame, CLERK_DONE, CLIENT_DONE};

/// Staging geometry the server announces to a new client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub chunk_size: usize,
    pub chunk_count: usize,
    pub message_size: usize,
}

/// One end of a TCP-backed channel
pub struct TcpChannel {
    /// Buffered writer; flushed on every signal
    writer: BufWriter<TcpStream>,
    mailbox: Arc<Mailbox>,
    pump: Option<JoinHandle<()>>,
    peer: String,
}

impl TcpChannel {
    /// Server end: announce geometry and start applying the client's writes
    pub fn accept(stream: TcpStream, arena: Arc<ChunkArena>, message_size: usize) -> Result<Self> {
        let peer = peer_name(&stream);
        stream.set_nodelay(true)?;

        let mut writer = BufWriter::new(stream.try_clone()?);
        write_frame(
            &mut writer,
            &Frame::Hello {
                chunk_size: arena.chunk_size() as u32,
                chunk_count: arena.chunk_count() as u32,
                message_size: message_size as u32,
            },
        )?;
        writer.flush()?;

        let mailbox = Arc::new(Mailbox::new(message_size, CLERK_DONE));
        let reader = BufReader::new(stream);
        let pump = spawn_pump(reader, Arc::clone(&mailbox), Some(arena), peer.clone())?;

        Ok(Self {
            writer,
            mailbox,
            pump: Some(pump),
            peer,
        })
    }

    /// Client end: connect, learn the geometry, start applying the clerk's writes
    pub fn connect(addr: impl ToSocketAddrs) -> Result<(Self, Geometry)> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| StageError::Transport(format!("connect failed: {}", e)))?;
        let peer = peer_name(&stream);
        stream.set_nodelay(true)?;

        let writer = BufWriter::new(stream.try_clone()?);
        let mut reader = BufReader::new(stream);

        let geometry = match read_frame(&mut reader)? {
            Frame::Hello { chunk_size, chunk_count, message_size } => Geometry {
                chunk_size: chunk_size as usize,
                chunk_count: chunk_count as usize,
                message_size: message_size as usize,
            },
            other => {
                return Err(StageError::Protocol(format!(
                    "expected HELLO from {}, got {:?}",
                    peer, other
                )))
            }
        };

        let mailbox = Arc::new(Mailbox::new(geometry.message_size, CLIENT_DONE));
        let pump = spawn_pump(reader, Arc::clone(&mailbox), None, peer.clone())?;

        let channel = Self {
            writer,
            mailbox,
            pump: Some(pump),
            peer,
        };
        Ok((channel, geometry))
    }

    fn send(&mut self, frame: &Frame) -> Result<()> {
        if self.mailbox.is_closed() {
            return Err(StageError::Disconnected(self.peer.clone()));
        }
        write_frame(&mut self.writer, frame)
    }
}

impl Channel for TcpChannel {
    fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    fn write_message(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.send(&Frame::Message {
            offset: offset as u32,
            data: Bytes::copy_from_slice(bytes),
        })
    }

    fn write_region(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.send(&Frame::Region {
            offset,
            data: Bytes::copy_from_slice(bytes),
        })
    }

    fn signal(&mut self, value: u32) -> Result<()> {
        self.send(&Frame::Signal { value })?;
        self.writer.flush()?;
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let _ = self.writer.get_ref().shutdown(Shutdown::Both);
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
    }
}

fn peer_name(stream: &TcpStream) -> String {
    stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Apply incoming frames to local memory until the stream ends
fn spawn_pump(
    mut reader: BufReader<TcpStream>,
    mailbox: Arc<Mailbox>,
    region: Option<Arc<ChunkArena>>,
    peer: String,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("pump-{}", peer))
        .spawn(move || {
            loop {
                let frame = match read_frame(&mut reader) {
                    Ok(frame) => frame,
                    Err(StageError::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        tracing::debug!("{} closed the stream", peer);
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("Stream from {} ended: {}", peer, e);
                        break;
                    }
                };

                if let Err(e) = apply(&frame, &mailbox, region.as_deref()) {
                    tracing::warn!("Dropping connection from {}: {}", peer, e);
                    let _ = reader.get_ref().shutdown(Shutdown::Both);
                    break;
                }
            }
            mailbox.close();
        })?;
    Ok(handle)
}

fn apply(frame: &Frame, mailbox: &Mailbox, region: Option<&ChunkArena>) -> Result<()> {
    match frame {
        Frame::Message { offset, data } => mailbox.write(*offset as usize, data),
        Frame::Region { offset, data } => match region {
            Some(arena) => arena.write_at(*offset, data),
            None => Err(StageError::Protocol(
                "peer wrote to a region this end does not expose".to_string(),
            )),
        },
        Frame::Signal { value } => {
            mailbox.flag().store(*value);
            Ok(())
        }
        Frame::Hello { .. } => Err(StageError::Protocol("unexpected HELLO".to_string())),
    }
}
