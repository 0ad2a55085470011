//! One TCP session to a master.
//!
//! A connection is an explicit state machine driven by a blocking loop on its own thread:
//!
//! ```text
//! Connecting ─▶ AwaitingRequest ─▶ Writing ─▶ ReadingHeader ─▶ ReadingPayload ─┐
//!     │               ▲   │                                                    │
//!     │               │   └─(idle / asked to stop)─▶ Stopped                   │
//!     │               └──────────────(persistent reuse)────────────────────────┘
//!     └─(connect failure)─▶ Stopped
//! ```
//!
//! Every failure becomes a [`Status`] reported to the pool and stored on the request;
//! nothing escapes the loop. The same machine also runs in ad-hoc mode, on the caller
//! thread, for exactly one preloaded request.
use std::{
    io,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::Arc,
    time::Duration,
};

use log::{debug, trace, warn};
use socket2::SockRef;

use crate::{
    config::Config,
    pool::ConnectionPool,
    protocol::{Header, Phase, ProtocolError, ProtocolTransport, Status},
    request::PendingRequest,
    timer::Deadline,
};

type Transport = ProtocolTransport<TcpStream>;

enum State {
    Connecting,
    AwaitingRequest(Transport),
    Writing(Transport, Arc<PendingRequest>),
    ReadingHeader(Transport, Arc<PendingRequest>, Deadline, Duration),
    ReadingPayload(Transport, Arc<PendingRequest>, Header, Deadline),
    Stopped,
}

enum Kind {
    Pooled(u64),
    AdHoc(Option<Arc<PendingRequest>>),
}

pub(crate) struct Connection {
    pool: ConnectionPool,
    kind: Kind,
}

impl Connection {
    /// A pool member registered under `id`.
    pub(crate) fn pooled(pool: ConnectionPool, id: u64) -> Self {
        Self {
            pool,
            kind: Kind::Pooled(id),
        }
    }

    /// A one-shot session serving `request` and nothing else.
    pub(crate) fn ad_hoc(pool: ConnectionPool, request: Arc<PendingRequest>) -> Self {
        Self {
            pool,
            kind: Kind::AdHoc(Some(request)),
        }
    }

    pub(crate) fn run(mut self) {
        let mut state = State::Connecting;
        while !matches!(state, State::Stopped) {
            state = self.step(state);
        }

        match self.kind {
            Kind::Pooled(id) => {
                debug!("{}: connection {id} stopped", self.pool.target());
                self.pool.connection_finished(id);
            }
            Kind::AdHoc(_) => {}
        }
    }

    fn step(&mut self, state: State) -> State {
        match state {
            State::Connecting => self.connect(),
            State::AwaitingRequest(transport) => match self.next_request() {
                Some(request) => State::Writing(transport, request),
                None => self.stop(transport),
            },
            State::Writing(transport, request) => self.write(transport, request),
            State::ReadingHeader(transport, request, deadline, timeout) => {
                self.read_header(transport, request, deadline, timeout)
            }
            State::ReadingPayload(transport, request, header, deadline) => {
                self.read_payload(transport, request, header, deadline)
            }
            State::Stopped => State::Stopped,
        }
    }

    fn connect(&mut self) -> State {
        let config = self.pool.config().snapshot();
        let target = self.pool.target();
        let mut deadline = Deadline::after(config.connect_timeout);

        let stream = match open(&target.host, target.port, &mut deadline) {
            Ok(stream) => stream,
            Err(e) => {
                let status = e.status(Phase::Connect);
                warn!("{target}: connect failed: {e}");
                self.pool.set_status(status);
                if let Kind::AdHoc(Some(request)) = &mut self.kind {
                    request.fail(status);
                    self.kind = Kind::AdHoc(None);
                }
                return State::Stopped;
            }
        };
        deadline.cancel();
        configure(&stream, &config);

        if let Kind::Pooled(id) = self.kind {
            self.pool.connected(id);
            debug!("{target}: connection {id} established");
        }
        State::AwaitingRequest(ProtocolTransport::new(stream))
    }

    fn next_request(&mut self) -> Option<Arc<PendingRequest>> {
        match &mut self.kind {
            Kind::Pooled(id) => self.pool.next_request(*id),
            Kind::AdHoc(request) => request.take(),
        }
    }

    fn write(&mut self, mut transport: Transport, request: Arc<PendingRequest>) -> State {
        let config = self.pool.config().snapshot();
        let Some(timeout) = processing_timeout(&config, &request) else {
            request.fail(Status::Expired);
            return self.after_exchange(transport);
        };
        let mut deadline = Deadline::after(timeout);

        trace!(
            "{}: writing request {} ({} bytes)",
            self.pool.target(),
            request.id(),
            request.request_payload().len()
        );
        match transport.write_request(
            request.request_header(),
            request.request_payload(),
            &mut deadline,
        ) {
            Ok(()) => State::ReadingHeader(transport, request, deadline, timeout),
            Err(e) => self.abort(transport, &request, &e, Phase::Write),
        }
    }

    fn read_header(
        &mut self,
        mut transport: Transport,
        request: Arc<PendingRequest>,
        mut deadline: Deadline,
        timeout: Duration,
    ) -> State {
        match transport.read_header(request.id(), &mut deadline) {
            Ok(header) => {
                trace!(
                    "{}: request {} answered {} with {} bytes",
                    self.pool.target(),
                    request.id(),
                    header.status(),
                    header.payload_size
                );
                deadline.rearm(timeout);
                State::ReadingPayload(transport, request, header, deadline)
            }
            Err(e) => self.abort(transport, &request, &e, Phase::ReadHeader),
        }
    }

    fn read_payload(
        &mut self,
        mut transport: Transport,
        request: Arc<PendingRequest>,
        header: Header,
        mut deadline: Deadline,
    ) -> State {
        let payload = match transport.read_payload(&header, &mut deadline) {
            Ok(payload) => payload,
            Err(e) => return self.abort(transport, &request, &e, Phase::ReadPayload),
        };
        deadline.cancel();

        let status = header.status();
        if !status.is_success() {
            debug!(
                "{}: request {} failed remotely with {status}",
                self.pool.target(),
                request.id()
            );
            self.pool.set_status(status);
        }
        request.complete(header, payload);
        self.after_exchange(transport)
    }

    /// Where to go once a request reached a terminal state with the stream still in sync.
    fn after_exchange(&mut self, transport: Transport) -> State {
        let stop = match self.kind {
            Kind::Pooled(id) => self.pool.stop_requested(id),
            Kind::AdHoc(_) => true,
        };
        if stop {
            self.stop(transport)
        } else {
            State::AwaitingRequest(transport)
        }
    }

    /// Reports a failed exchange and drops the session, whose stream is out of sync.
    fn abort(
        &mut self,
        transport: Transport,
        request: &PendingRequest,
        error: &ProtocolError,
        phase: Phase,
    ) -> State {
        let mut status = error.status(phase);
        if request.is_healthcheck() && status == Status::ProcessingTimeout {
            status = Status::HealthcheckTimeout;
        }
        debug!(
            "{}: request {} failed during {phase}: {error}",
            self.pool.target(),
            request.id()
        );
        self.pool.set_status(status);
        request.fail(status);
        self.stop(transport)
    }

    fn stop(&mut self, transport: Transport) -> State {
        close(transport.get_ref());
        State::Stopped
    }
}

/// Processing budget for one exchange, or `None` when the caller has already given up.
fn processing_timeout(config: &Config, request: &PendingRequest) -> Option<Duration> {
    if request.is_healthcheck() {
        return Some(config.healthcheck_timeout);
    }
    if config.use_client_specified_timeout {
        let remaining = request.max_processing_time();
        return (!remaining.is_zero()).then_some(remaining);
    }
    Some(config.processing_timeout)
}

fn open(host: &str, port: u16, deadline: &mut Deadline) -> Result<TcpStream, ProtocolError> {
    let addrs = (host, port).to_socket_addrs()?.collect::<Vec<SocketAddr>>();
    let mut last = io::Error::new(
        io::ErrorKind::AddrNotAvailable,
        format!("{host}:{port} resolved to no address"),
    );

    for addr in addrs {
        let remaining = deadline
            .remaining()
            .ok_or(ProtocolError::Timeout(Phase::Connect))?;
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                return Err(ProtocolError::Timeout(Phase::Connect));
            }
            Err(e) => last = e,
        }
    }
    Err(last.into())
}

fn configure(stream: &TcpStream, config: &Config) {
    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_nodelay(true) {
        warn!("failed to set TCP_NODELAY: {e}");
    }
    let linger = config.linger.then_some(config.linger_time);
    if let Err(e) = socket.set_linger(linger) {
        warn!("failed to set SO_LINGER: {e}");
    }
    if let Err(e) = socket.set_keepalive(config.keep_alive) {
        warn!("failed to set SO_KEEPALIVE: {e}");
    }
}

fn close(stream: &TcpStream) {
    // Already-closed sockets report NotConnected.
    let _ = stream.shutdown(Shutdown::Both);
}
