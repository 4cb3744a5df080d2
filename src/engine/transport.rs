//! Socket abstraction
//!
//! A [`Transport`] is one open session with the query server. Reads are
//! always non-blocking (`WouldBlock` when nothing is buffered); writes
//! complete fully or fail. [`Connector`] opens transports and is the seam
//! tests use to replace TCP.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// One open session with the query server
pub trait Transport: Read + Send {
    /// Writes every byte or returns the error that stopped it.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Closes the session. Further reads report end of stream.
    fn close(&mut self);
}

/// Opens transports
pub trait Connector: Send + Sync {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Box<dyn Transport>>;
}

/// Plain TCP connector
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> io::Result<Box<dyn Transport>> {
        let addrs: Vec<SocketAddr> = (host, port).to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address for {host}:{port}"),
            ));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Ok(Box::new(TcpTransport::new(stream, timeout)?)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| io::ErrorKind::NotConnected.into()))
    }
}

/// TCP session: non-blocking reads, blocking (bounded) writes
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    fn new(stream: TcpStream, write_timeout: Duration) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(write_timeout))?;
        stream.set_nonblocking(true)?;
        Ok(Self { stream })
    }
}

impl Read for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.set_nonblocking(false)?;
        let result = self
            .stream
            .write_all(bytes)
            .and_then(|()| self.stream.flush());
        self.stream.set_nonblocking(true)?;
        result
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
