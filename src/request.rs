//! In-flight requests.
//!
//! A [`PendingRequest`] is created by the caller, handed to a pool queue, and serviced by
//! at most one connection. Completion is a one-shot rendezvous: whichever of success,
//! error, cancellation or expiry gets there first wins, and every later attempt is a no-op.
use std::{
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crate::protocol::{Header, ProtocolError, RequestKey, Status, encode_request};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Terminal result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub status: Status,
    pub header: Option<Header>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct Completion {
    outcome: Option<Outcome>,
}

#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    data_type: String,
    dao_version: u32,
    header: Header,
    payload: Vec<u8>,
    healthcheck: bool,
    created: Instant,
    deadline: Instant,
    cancelled: AtomicBool,
    state: Mutex<Completion>,
    done: Condvar,
}

impl PendingRequest {
    /// Builds a lookup of `key`, to be answered before `timeout` elapses.
    pub fn lookup(
        key: RequestKey,
        dao_version: u32,
        timeout: Duration,
    ) -> Result<Arc<Self>, ProtocolError> {
        let id = next_request_id();
        let (header, payload) = encode_request(id, dao_version, Some(&key))?;
        Ok(Arc::new(Self::new(
            id,
            key.data_type,
            dao_version,
            header,
            payload,
            false,
            timeout,
        )))
    }

    /// Builds a zero-payload ping.
    pub fn healthcheck(timeout: Duration) -> Arc<Self> {
        let id = next_request_id();
        let header = Header::new(id, 0, 0, Status::HealthcheckOk);
        Arc::new(Self::new(
            id,
            String::new(),
            0,
            header,
            Vec::new(),
            true,
            timeout,
        ))
    }

    fn new(
        id: u64,
        data_type: String,
        dao_version: u32,
        header: Header,
        payload: Vec<u8>,
        healthcheck: bool,
        timeout: Duration,
    ) -> Self {
        let created = Instant::now();
        Self {
            id,
            data_type,
            dao_version,
            header,
            payload,
            healthcheck,
            created,
            deadline: created + timeout,
            cancelled: AtomicBool::new(false),
            state: Mutex::new(Completion::default()),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn dao_version(&self) -> u32 {
        self.dao_version
    }

    pub fn is_healthcheck(&self) -> bool {
        self.healthcheck
    }

    pub fn request_header(&self) -> &Header {
        &self.header
    }

    pub fn request_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.created.elapsed()
    }

    /// Time the caller is still willing to wait, used as the processing timeout when the
    /// client-specified timeout is enabled.
    pub fn max_processing_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Stores the response. Returns `false` if the request already reached a terminal state.
    pub fn complete(&self, header: Header, payload: Vec<u8>) -> bool {
        self.finish(Outcome {
            status: header.status(),
            header: Some(header),
            payload,
        })
    }

    /// Fails the request with `status`. Returns `false` if it was already terminal.
    pub fn fail(&self, status: Status) -> bool {
        self.finish(Outcome {
            status,
            header: None,
            payload: Vec::new(),
        })
    }

    /// Cancels the request, waking its waiter with `status`.
    ///
    /// Safe to call from any thread, any number of times.
    pub fn cancel(&self, status: Status) -> bool {
        self.cancelled.store(true, Ordering::Release);
        self.fail(status)
    }

    fn finish(&self, outcome: Outcome) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.done.notify_all();
        true
    }

    /// Blocks until the request completes or its deadline passes. An expired request is
    /// cancelled with [`Status::Expired`].
    pub fn wait(&self) -> Outcome {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = &state.outcome {
                return outcome.clone();
            }
            let now = Instant::now();
            if now >= self.deadline {
                drop(state);
                self.cancel(Status::Expired);
                state = self.lock();
                continue;
            }
            state = self
                .done
                .wait_timeout(state, self.deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Result so far, without blocking.
    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Completion> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
