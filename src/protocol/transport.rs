use std::{
    io::{self, Read, Write},
    net::TcpStream,
    time::Duration,
};

use thiserror::Error;

use crate::timer::Deadline;

use super::{
    Header, RequestKey, Status,
    header::{HEADER_SIZE, MAX_PAYLOAD_SIZE},
};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode frame: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
    #[error("deadline fired during {0}")]
    Timeout(Phase),
    #[error("peer closed the stream after {read} of {expected} bytes")]
    Eof { expected: usize, read: usize },
    #[error("wrong magic value {0:#010x}")]
    Magic(u32),
    #[error("protocol version mismatch, expected {expected} found {found}")]
    Version { expected: u32, found: u32 },
    #[error("announced payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(u32),
    #[error("{0} trailing bytes after request key")]
    TrailingBytes(usize),
    #[error("response for request {found} while waiting for {expected}")]
    RequestId { expected: u64, found: u64 },
}

/// Wire phase an error was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connect,
    Write,
    ReadHeader,
    ReadPayload,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Connect => "connect",
            Phase::Write => "write",
            Phase::ReadHeader => "header read",
            Phase::ReadPayload => "payload read",
        };
        f.write_str(name)
    }
}

impl ProtocolError {
    /// Status reported to the pool and the request for an error seen in `phase`.
    pub fn status(&self, phase: Phase) -> Status {
        match self {
            ProtocolError::Timeout(Phase::Connect) => Status::ConnectTimeout,
            ProtocolError::Timeout(_) => Status::ProcessingTimeout,
            ProtocolError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Status::ConnectionRefused
            }
            ProtocolError::Io(_) | ProtocolError::Eof { .. } => match phase {
                Phase::Connect => Status::ConnectError,
                Phase::Write => Status::WriteError,
                Phase::ReadHeader | Phase::ReadPayload => Status::ReadError,
            },
            ProtocolError::Version { .. } => Status::ProtocolVersionMismatch,
            ProtocolError::Magic(_)
            | ProtocolError::PayloadTooLarge(_)
            | ProtocolError::RequestId { .. }
            | ProtocolError::Deserialize(_)
            | ProtocolError::TrailingBytes(_) => Status::WrongMagicString,
            ProtocolError::Serialize(_) => Status::InvalidRequest,
        }
    }
}

/// A stream whose blocking calls can be bounded by a timeout.
pub trait TimedStream: Read + Write {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl TimedStream for TcpStream {
    fn set_io_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        // A zero timeout is rejected by the socket layer.
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Reads a request frame, as the master does. Returns `None` on a clean close.
    pub fn read_request(&mut self) -> Result<Option<(Header, Vec<u8>)>, ProtocolError> {
        let mut buf = [0; HEADER_SIZE];
        let read = read_untimed(&mut self.stream, &mut buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < HEADER_SIZE {
            return Err(ProtocolError::Eof {
                expected: HEADER_SIZE,
                read,
            });
        }

        let header = Header::try_from(&buf)?;
        header.validate()?;

        let mut payload = vec![0; header.payload_size as usize];
        let read = read_untimed(&mut self.stream, &mut payload)?;
        if read < payload.len() {
            return Err(ProtocolError::Eof {
                expected: payload.len(),
                read,
            });
        }
        Ok(Some((header, payload)))
    }

    pub fn write_response(&mut self, header: Header, payload: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(&header.as_bytes()?)?;
        self.stream.write_all(payload)?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<T: TimedStream> ProtocolTransport<T> {
    /// Writes a request header and payload before `deadline` fires.
    pub fn write_request(
        &mut self,
        header: &Header,
        payload: &[u8],
        deadline: &mut Deadline,
    ) -> Result<(), ProtocolError> {
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.as_bytes()?);
        frame.extend_from_slice(payload);

        let mut written = 0;
        while written < frame.len() {
            let remaining = deadline
                .remaining()
                .ok_or(ProtocolError::Timeout(Phase::Write))?;
            self.stream.set_io_timeout(Some(remaining))?;
            match self.stream.write(&frame[written..]) {
                Ok(0) => {
                    return Err(ProtocolError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "short write",
                    )));
                }
                Ok(n) => written += n,
                Err(e) if retryable(&e) => continue,
                Err(_) if deadline.remaining().is_none() => {
                    return Err(ProtocolError::Timeout(Phase::Write));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.stream.flush()?;
        Ok(())
    }

    /// Reads and validates a response header, checking it answers `request_id`.
    pub fn read_header(
        &mut self,
        request_id: u64,
        deadline: &mut Deadline,
    ) -> Result<Header, ProtocolError> {
        let mut buf = [0; HEADER_SIZE];
        self.read_exact(&mut buf, Phase::ReadHeader, deadline)?;

        let header = Header::try_from(&buf)?;
        header.validate()?;
        if header.request_id != request_id {
            return Err(ProtocolError::RequestId {
                expected: request_id,
                found: header.request_id,
            });
        }
        Ok(header)
    }

    pub fn read_payload(
        &mut self,
        header: &Header,
        deadline: &mut Deadline,
    ) -> Result<Vec<u8>, ProtocolError> {
        if header.payload_size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge(header.payload_size));
        }
        let mut payload = vec![0; header.payload_size as usize];
        self.read_exact(&mut payload, Phase::ReadPayload, deadline)?;
        Ok(payload)
    }

    fn read_exact(
        &mut self,
        buf: &mut [u8],
        phase: Phase,
        deadline: &mut Deadline,
    ) -> Result<(), ProtocolError> {
        let mut read = 0;
        while read < buf.len() {
            let remaining = deadline.remaining().ok_or(ProtocolError::Timeout(phase))?;
            self.stream.set_io_timeout(Some(remaining))?;
            match self.stream.read(&mut buf[read..]) {
                Ok(0) => {
                    return Err(ProtocolError::Eof {
                        expected: buf.len(),
                        read,
                    });
                }
                Ok(n) => read += n,
                Err(e) if retryable(&e) => continue,
                Err(_) if deadline.remaining().is_none() => {
                    return Err(ProtocolError::Timeout(phase));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Encodes a cache lookup into a request header and payload.
pub fn encode_request(
    request_id: u64,
    dao_version: u32,
    key: Option<&RequestKey>,
) -> Result<(Header, Vec<u8>), ProtocolError> {
    match key {
        Some(key) => {
            let payload = key.as_bytes()?;
            let header = Header::new(request_id, dao_version, payload.len() as u32, Status::None);
            Ok((header, payload))
        }
        None => Ok((
            Header::new(request_id, dao_version, 0, Status::HealthcheckOk),
            Vec::new(),
        )),
    }
}

fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn read_untimed<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let mut read = 0;
    while read < buf.len() {
        match stream.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Seek},
        time::Duration,
    };

    use super::*;

    impl TimedStream for Cursor<Vec<u8>> {
        fn set_io_timeout(&mut self, _: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    /// Yields `WouldBlock` forever, like a socket whose peer never answers.
    struct Silent;

    impl Read for Silent {
        fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    impl Write for Silent {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl TimedStream for Silent {
        fn set_io_timeout(&mut self, _: Option<Duration>) -> io::Result<()> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        }
    }

    fn key() -> RequestKey {
        RequestKey {
            persistent: true,
            data_type: "TaxCode".into(),
            key: b"US1".to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn read_write_request() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let mut deadline = Deadline::after(Duration::from_secs(5));

        let (header, payload) = encode_request(9, 3, Some(&key())).unwrap();
        transport
            .write_request(&header, &payload, &mut deadline)
            .unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let (read, body) = transport.read_request().unwrap().unwrap();
        assert_eq!(read, header);
        assert_eq!(RequestKey::try_from(body.as_slice()).unwrap(), key());
    }

    #[test]
    fn read_write_response() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        let header = Header::new(11, 1, 5, Status::ValueFound);

        transport.write_response(header, b"value").unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let mut deadline = Deadline::after(Duration::from_secs(5));
        let read = transport.read_header(11, &mut deadline).unwrap();
        assert_eq!(read, header);
        assert_eq!(transport.read_payload(&read, &mut deadline).unwrap(), b"value");
    }

    #[test]
    fn healthcheck_request_has_no_payload() {
        let (header, payload) = encode_request(1, 0, None).unwrap();
        assert!(payload.is_empty());
        assert_eq!(header.payload_size, 0);
        assert_eq!(header.status(), Status::HealthcheckOk);
    }

    #[test]
    fn read_request_on_closed_stream() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        assert!(transport.read_request().unwrap().is_none());
    }

    #[test]
    fn short_header_is_eof() {
        let mut transport = ProtocolTransport::new(Cursor::new(vec![0x52, 0x43]));
        let mut deadline = Deadline::after(Duration::from_secs(5));

        let err = transport.read_header(1, &mut deadline).unwrap_err();
        assert!(matches!(err, ProtocolError::Eof { read: 2, .. }));
        assert_eq!(err.status(Phase::ReadHeader), Status::ReadError);
    }

    #[test]
    fn mismatched_request_id() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        transport
            .write_response(Header::new(2, 1, 0, Status::NotFound), &[])
            .unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let mut deadline = Deadline::after(Duration::from_secs(5));
        let err = transport.read_header(1, &mut deadline).unwrap_err();
        assert_eq!(err.status(Phase::ReadHeader), Status::WrongMagicString);
    }

    #[test]
    fn silent_peer_times_out() {
        let mut transport = ProtocolTransport::new(Silent);
        let mut deadline = Deadline::after(Duration::from_millis(20));

        let err = transport.read_header(1, &mut deadline).unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(Phase::ReadHeader)));
        assert!(deadline.fired());
        assert_eq!(err.status(Phase::ReadHeader), Status::ProcessingTimeout);
    }

    #[test]
    fn completed_read_wins_over_late_deadline() {
        let mut transport = ProtocolTransport::new(Cursor::new(Vec::new()));
        transport
            .write_response(Header::new(5, 1, 0, Status::NotFound), &[])
            .unwrap();
        transport.stream.seek(std::io::SeekFrom::Start(0)).unwrap();

        let mut deadline = Deadline::after(Duration::from_millis(50));
        let header = transport.read_header(5, &mut deadline).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        assert_eq!(header.status(), Status::NotFound);
        assert!(!deadline.fired());
    }

    #[test]
    fn refused_connection_maps_to_host_status() {
        let err = ProtocolError::Io(io::ErrorKind::ConnectionRefused.into());
        assert_eq!(err.status(Phase::Connect), Status::ConnectionRefused);

        let err = ProtocolError::Io(io::ErrorKind::BrokenPipe.into());
        assert_eq!(err.status(Phase::Write), Status::WriteError);
    }
}
