//! Transport links to ECUs
//!
//! A [`Link`] is a connected, non-blocking byte pipe. A [`Connector`] opens
//! links; it runs on a short-lived connect thread so the caller's event
//! context never waits on a TCP handshake or a serial open.

use crate::tree::Interface;
use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// Read timeout for serial ports; reads return nothing after this long
const SERIAL_POLL_TIMEOUT: Duration = Duration::from_millis(5);

pub trait Link: Send {
    /// Read whatever is available. `Ok(0)` means nothing right now.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Hardware handshake status (DSR). Links without one are always online.
    fn online(&mut self) -> io::Result<bool> {
        Ok(true)
    }
}

pub trait Connector: Send + Sync {
    fn connect(&self, interface: &Interface) -> io::Result<Box<dyn Link>>;
}

/// Opens real TCP sockets and serial ports
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConnector;

impl Connector for SystemConnector {
    fn connect(&self, interface: &Interface) -> io::Result<Box<dyn Link>> {
        match interface {
            Interface::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))?;
                stream.set_nodelay(true)?;
                stream.set_nonblocking(true)?;
                Ok(Box::new(TcpLink { stream }))
            }
            Interface::Serial { port, baud_rate } => {
                let port = serialport::new(port.as_str(), *baud_rate)
                    .timeout(SERIAL_POLL_TIMEOUT)
                    .flow_control(serialport::FlowControl::None)
                    .open()
                    .map_err(io::Error::from)?;
                Ok(Box::new(SerialLink { port }))
            }
        }
    }
}

pub struct TcpLink {
    stream: TcpStream,
}

impl Link for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.read(buf) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by peer")),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        // the socket is non-blocking; retry until the kernel takes everything
        let mut rest = data;
        while !rest.is_empty() {
            match self.stream.write(rest) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "socket closed")),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl Link for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut || e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        Write::write_all(&mut self.port, data)?;
        self.port.flush()
    }

    fn online(&mut self) -> io::Result<bool> {
        self.port.read_data_set_ready().map_err(io::Error::from)
    }
}
