use std::io::{self, IoSlice, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

/// An I/O failure, tagged with the operation that failed. Nothing at this
/// layer is retried beyond EINTR; the session treats any of these as fatal.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct CommsError {
    pub op: &'static str,
    #[source]
    pub source: io::Error,
}

fn tag(op: &'static str) -> impl FnOnce(io::Error) -> CommsError {
    move |source| CommsError { op, source }
}

/// Outcome of receiving a data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    Ok,
    /// The peer's length prefix disagreed with the expected length for this
    /// exchange. The payload has been drained so the peer can still read
    /// our verdict byte.
    LengthMismatch { actual: u32 },
}

/// The socket connection between master and apprentice.
///
/// A data packet on the wire is a 4-byte network-order length followed by
/// that many payload bytes; a verdict is a single byte. Both ends must agree
/// on the payload length of each individual exchange; the length prefix
/// exists to turn a disagreement into a clean failure instead of a silent
/// deadlock.
pub struct Comms {
    stream: TcpStream,
}

impl Comms {
    pub fn new(stream: TcpStream) -> Comms {
        Comms { stream }
    }

    /// Master side: accept exactly one apprentice, then close the listener.
    pub fn listen(port: u16) -> Result<Comms, CommsError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(tag("bind"))?;
        let stream = loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::info!("accepted connection from {peer}");
                    break stream;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(tag("accept")(e)),
            }
        };
        stream.set_nodelay(true).map_err(tag("setsockopt"))?;
        Ok(Comms::new(stream))
    }

    /// Apprentice side: connect to the master.
    pub fn connect(host: &str, port: u16) -> Result<Comms, CommsError> {
        let stream = TcpStream::connect((host, port)).map_err(tag("connect"))?;
        stream.set_nodelay(true).map_err(tag("setsockopt"))?;
        Ok(Comms::new(stream))
    }

    /// Send one data packet and wait for the peer's verdict byte.
    ///
    /// The length prefix and the payload go out as a single vectored write:
    /// a separate 4-byte write would sit in the delayed-ACK window on every
    /// single exchange.
    pub fn send_data_pkt(&mut self, payload: &[u8]) -> Result<u8, CommsError> {
        let mut header = [0u8; 4];
        NetworkEndian::write_u32(&mut header, payload.len() as u32);
        self.write_all_vectored(&header, payload)
            .map_err(tag("write"))?;

        let mut verdict = [0u8; 1];
        self.stream.read_exact(&mut verdict).map_err(tag("read"))?;
        Ok(verdict[0])
    }

    /// Receive one data packet of exactly `buf.len()` bytes.
    pub fn recv_data_pkt(&mut self, buf: &mut [u8]) -> Result<Received, CommsError> {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).map_err(tag("read"))?;
        let actual = NetworkEndian::read_u32(&header);
        if actual as usize != buf.len() {
            // Read the data anyway so the peer can still take our verdict.
            self.discard(actual).map_err(tag("read"))?;
            return Ok(Received::LengthMismatch { actual });
        }
        self.stream.read_exact(buf).map_err(tag("read"))?;
        Ok(Received::Ok)
    }

    pub fn send_response_byte(&mut self, verdict: u8) -> Result<(), CommsError> {
        self.stream.write_all(&[verdict]).map_err(tag("write"))
    }

    fn write_all_vectored(&mut self, header: &[u8], payload: &[u8]) -> io::Result<()> {
        let mut slices = [IoSlice::new(header), IoSlice::new(payload)];
        let mut remaining = &mut slices[..];
        while !remaining.is_empty() {
            match self.stream.write_vectored(remaining) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => IoSlice::advance_slices(&mut remaining, n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn discard(&mut self, mut len: u32) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        while len > 0 {
            let want = scratch.len().min(len as usize);
            match self.stream.read(&mut scratch[..want]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => len -= n as u32,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn loopback_pair() -> (Comms, Comms) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (Comms::new(server), Comms::new(client))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn packet_roundtrip_and_verdict() {
        let (mut master, mut apprentice) = loopback_pair();
        let payload: Vec<u8> = (0..=255u8).collect();

        let sender = thread::spawn(move || {
            let verdict = apprentice.send_data_pkt(&payload).unwrap();
            assert_eq!(verdict, 0);
        });

        let mut buf = [0u8; 256];
        assert_eq!(master.recv_data_pkt(&mut buf).unwrap(), Received::Ok);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[255], 255);
        master.send_response_byte(0).unwrap();
        sender.join().unwrap();
    }

    #[test]
    fn length_mismatch_drains_payload() {
        let (mut master, mut apprentice) = loopback_pair();

        let sender = thread::spawn(move || {
            // A payload 8 bytes shorter than the master expects: the
            // verdict must still arrive.
            let verdict = apprentice.send_data_pkt(&[0u8; 248]).unwrap();
            assert_eq!(verdict, 2);

            // The stream must still be aligned for the next exchange.
            let verdict = apprentice.send_data_pkt(&[7u8; 256]).unwrap();
            assert_eq!(verdict, 0);
        });

        let mut buf = [0u8; 256];
        assert_eq!(
            master.recv_data_pkt(&mut buf).unwrap(),
            Received::LengthMismatch { actual: 248 }
        );
        master.send_response_byte(2).unwrap();

        assert_eq!(master.recv_data_pkt(&mut buf).unwrap(), Received::Ok);
        assert_eq!(buf, [7u8; 256]);
        master.send_response_byte(0).unwrap();
        sender.join().unwrap();
    }

    #[test]
    fn oversized_packet_is_also_a_length_mismatch() {
        let (mut master, mut apprentice) = loopback_pair();

        let sender = thread::spawn(move || {
            let verdict = apprentice.send_data_pkt(&[1u8; 300]).unwrap();
            assert_eq!(verdict, 2);
        });

        let mut buf = [0u8; 256];
        assert_eq!(
            master.recv_data_pkt(&mut buf).unwrap(),
            Received::LengthMismatch { actual: 300 }
        );
        master.send_response_byte(2).unwrap();
        sender.join().unwrap();
    }

    #[test]
    fn peer_disconnect_is_an_error() {
        let (mut master, apprentice) = loopback_pair();
        drop(apprentice);

        let mut buf = [0u8; 16];
        let err = master.recv_data_pkt(&mut buf).unwrap_err();
        assert_eq!(err.op, "read");
    }
}
