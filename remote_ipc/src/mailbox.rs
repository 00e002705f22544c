use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Shared memory between the two cores
///
/// Requests are consumed in arrival order. Responses are keyed by request
/// id because they may complete out of order.
#[derive(Debug, Default)]
pub struct Mailbox {
    requests: Mutex<VecDeque<Vec<u8>>>,
    responses: Mutex<HashMap<u64, Vec<u8>>>,
    answered: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post_request(&self, frame: Vec<u8>) {
        self.requests.lock().push_back(frame);
    }

    pub fn take_request(&self) -> Option<Vec<u8>> {
        self.requests.lock().pop_front()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn post_response(&self, request_id: u64, frame: Vec<u8>) {
        let mut responses = self.responses.lock();
        if responses.insert(request_id, frame).is_some() {
            log::warn!("request {} answered twice", request_id);
        }
        self.answered.notify_all();
    }

    pub fn try_response(&self, request_id: u64) -> Option<Vec<u8>> {
        self.responses.lock().remove(&request_id)
    }

    /// Blocks until `request_id` is answered or `timeout` passes
    pub fn wait_response(&self, request_id: u64, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut responses = self.responses.lock();
        loop {
            if let Some(frame) = responses.remove(&request_id) {
                return Some(frame);
            }
            if self.answered.wait_until(&mut responses, deadline).timed_out() {
                return responses.remove(&request_id);
            }
        }
    }
}
