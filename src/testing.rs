//! Loopback master used by the end-to-end tests.
use std::{
    io::Write,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::protocol::{HEADER_SIZE, Header, ProtocolTransport, RequestKey, Status};

/// How the master answers one request.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Value(Vec<u8>),
    NotFound,
    Status(Status),
    /// Sleeps, then answers as `NotFound` (or `HealthcheckOk` for a ping).
    Delay(Duration),
    /// A header with a wrong magic value.
    Garbage,
    /// A header announcing more payload than is sent before the stream closes.
    Truncated,
    /// Hangs up without answering.
    Close,
}

type Handler = dyn Fn(&RequestKey) -> Reply + Send + Sync;

#[derive(Default)]
struct Counters {
    connections: AtomicUsize,
    lookups: AtomicUsize,
    healthchecks: AtomicUsize,
}

pub(crate) struct FakeMaster {
    address: SocketAddr,
    counters: Arc<Counters>,
    stopped: Arc<AtomicBool>,
    streams: Arc<Mutex<Vec<TcpStream>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl FakeMaster {
    /// Listens on an ephemeral loopback port. Pings are answered through `handler` with an
    /// empty key.
    pub(crate) fn start<F>(handler: F) -> Self
    where
        F: Fn(&RequestKey) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind fake master");
        let address = listener.local_addr().expect("fake master has no address");
        let handler: Arc<Handler> = Arc::new(handler);
        let counters = Arc::new(Counters::default());
        let stopped = Arc::new(AtomicBool::new(false));
        let streams = Arc::new(Mutex::new(Vec::new()));

        let accept = {
            let counters = Arc::clone(&counters);
            let stopped = Arc::clone(&stopped);
            let streams = Arc::clone(&streams);
            thread::spawn(move || {
                for stream in listener.incoming() {
                    if stopped.load(Ordering::Acquire) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            counters.connections.fetch_add(1, Ordering::AcqRel);
                            if let Ok(clone) = stream.try_clone() {
                                streams
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(clone);
                            }
                            let handler = Arc::clone(&handler);
                            let counters = Arc::clone(&counters);
                            thread::spawn(move || handle_connection(stream, &*handler, &counters));
                        }
                        Err(e) => warn!("fake master: broken connection: {e:?}"),
                    }
                }
            })
        };

        Self {
            address,
            counters,
            stopped,
            streams,
            listener: Mutex::new(Some(accept)),
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.address.port()
    }

    /// Connections accepted so far.
    pub(crate) fn connections(&self) -> usize {
        self.counters.connections.load(Ordering::Acquire)
    }

    pub(crate) fn lookups(&self) -> usize {
        self.counters.lookups.load(Ordering::Acquire)
    }

    pub(crate) fn healthchecks(&self) -> usize {
        self.counters.healthchecks.load(Ordering::Acquire)
    }

    /// Closes the listening socket and every accepted stream.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wakes the accept loop so it sees the flag.
        let _ = TcpStream::connect_timeout(&self.address, Duration::from_millis(200));
        if let Some(accept) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = accept.join();
        }
        for stream in self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for FakeMaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(stream: TcpStream, handler: &Handler, counters: &Counters) {
    let mut transport = ProtocolTransport::new(stream);

    loop {
        let (header, payload) = match transport.read_request() {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                debug!("fake master: dropping connection: {e}");
                return;
            }
        };

        let ping = header.status() == Status::HealthcheckOk && payload.is_empty();
        let reply = if ping {
            counters.healthchecks.fetch_add(1, Ordering::AcqRel);
            handler(&RequestKey::default())
        } else {
            counters.lookups.fetch_add(1, Ordering::AcqRel);
            match RequestKey::try_from(payload.as_slice()) {
                Ok(key) => handler(&key),
                Err(_) => Reply::Status(Status::InvalidRequest),
            }
        };

        let answered = if ping { Status::HealthcheckOk } else { Status::NotFound };
        let (status, body) = match reply {
            Reply::Value(value) if !ping => (Status::ValueFound, value),
            Reply::Value(_) | Reply::NotFound => (answered, Vec::new()),
            Reply::Status(status) => (status, Vec::new()),
            Reply::Delay(delay) => {
                thread::sleep(delay);
                (answered, Vec::new())
            }
            Reply::Garbage => {
                let mut stream = transport.into_inner();
                let _ = stream.write_all(&[0xab; HEADER_SIZE]);
                return;
            }
            Reply::Truncated => {
                let header = Header::new(header.request_id, header.dao_version, 100, Status::ValueFound);
                let _ = transport.write_response(header, &[0; 10]);
                return;
            }
            Reply::Close => return,
        };

        let response = Header::new(
            header.request_id,
            header.dao_version,
            body.len() as u32,
            status,
        );
        if transport.write_response(response, &body).is_err() {
            return;
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
