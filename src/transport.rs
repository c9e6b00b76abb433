use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};

use log::debug;

use crate::config::ServerAddress;
use crate::error::ClientError;
use crate::PACKET_SIZE;

/// Blocking stream transport with fixed 1024-byte packet framing.
///
/// Both directions move whole packets: outgoing data is zero-padded up to
/// the next packet boundary, incoming data is drained packet by packet until
/// the caller-requested byte count is reached and the excess in the final
/// packet is discarded. The relay never pipelines, so discarding is safe.
///
/// One request-response pair per connection; `send_receive` wraps the whole
/// connect/send/receive/close cycle for fixed-size exchanges. Any I/O
/// failure closes the socket before the error propagates.
pub struct Transport {
    address: ServerAddress,
    stream: Option<TcpStream>,
}

impl Transport {
    pub fn new(address: ServerAddress) -> Transport {
        Transport {
            address,
            stream: None,
        }
    }

    pub fn connect(&mut self) -> Result<(), ClientError> {
        self.close();
        let stream = TcpStream::connect((self.address.host(), self.address.port()))
            .map_err(ClientError::Transport)?;
        debug!("connected to {}", self.address);
        self.stream = Some(stream);
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!("connection to {} closed", self.address);
        }
    }

    /// Send `data` as a run of full packets, padding the tail with zeros.
    pub fn send(&mut self, data: &[u8]) -> Result<(), ClientError> {
        debug!("sending {} bytes", data.len());
        self.io(|stream| {
            for chunk in data.chunks(PACKET_SIZE) {
                let mut packet = [0u8; PACKET_SIZE];
                packet[..chunk.len()].copy_from_slice(chunk);
                stream.write_all(&packet)?;
            }
            stream.flush()
        })
    }

    /// Receive exactly `size` bytes, reading whole packets off the socket.
    pub fn receive(&mut self, size: usize) -> Result<Vec<u8>, ClientError> {
        debug!("receiving {} bytes", size);
        self.io(|stream| {
            let mut data = Vec::with_capacity(size);
            while data.len() < size {
                let mut packet = [0u8; PACKET_SIZE];
                stream.read_exact(&mut packet)?;
                let wanted = (size - data.len()).min(PACKET_SIZE);
                data.extend_from_slice(&packet[..wanted]);
            }
            Ok(data)
        })
    }

    /// One full exchange: connect, send the request, receive a fixed-size
    /// response, close.
    pub fn send_receive(
        &mut self,
        request: &[u8],
        response_size: usize,
    ) -> Result<Vec<u8>, ClientError> {
        self.connect()?;
        let result = self
            .send(request)
            .and_then(|_| self.receive(response_size));
        self.close();
        result
    }

    fn io<T>(
        &mut self,
        operation: impl FnOnce(&mut TcpStream) -> io::Result<T>,
    ) -> Result<T, ClientError> {
        let stream = self.stream.as_mut().ok_or_else(|| {
            ClientError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "not connected to the server",
            ))
        })?;
        match operation(stream) {
            Ok(value) => Ok(value),
            Err(e) => {
                self.close();
                Err(ClientError::Transport(e))
            }
        }
    }
}
