//! Self-preservation: throttling of bulk eviction.
//!
//! The keeper hands out eviction permits only while the registry stays
//! within an allowed percentage drop of its *steady state* size. The steady
//! state is captured when the first permit is requested after an idle
//! period and released once every request has been settled, so a burst of
//! expirations is measured against the size the registry had before the
//! burst began.
//!
//! Permits are pull based. A consumer [`request`](QuotaStream::request)s
//! permits and receives them one at a time from the [`QuotaStream`]. A
//! granted permit stays *in flight* until the consumer polls the stream
//! again, and no further permit is granted while one is in flight, so every
//! decision sees the size produced by the previous eviction.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

pub const DEFAULT_ALLOWED_PERCENTAGE_DROP: u8 = 20;

/// True if evicting one more entry keeps `size` within `allowed_drop`
/// percent of `steady`.
pub fn is_eviction_allowed(size: usize, steady: usize, allowed_drop: u8) -> bool {
    if size == 0 || steady == 0 {
        return false;
    }
    let allowed_drop = u128::from(allowed_drop.min(100));
    (size as u128 - 1) * 100 >= steady as u128 * (100 - allowed_drop)
}

#[derive(Clone)]
pub struct EvictionQuotaKeeper {
    shared: Arc<Shared>,
}

struct Shared {
    allowed_drop: u8,
    size: watch::Receiver<usize>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    pending: u64,
    in_flight: bool,
    steady: Option<usize>,
    preserving: bool,
    grants: Option<mpsc::UnboundedSender<u64>>,
}

impl EvictionQuotaKeeper {
    /// `size` follows the registry size. Changes are picked up by
    /// [`follow_size`](Self::follow_size).
    pub fn new(allowed_drop: u8, size: watch::Receiver<usize>) -> Self {
        Self {
            shared: Arc::new(Shared {
                allowed_drop: allowed_drop.min(100),
                size,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Opens a permit stream. Opening a new stream abandons the previous
    /// one together with its outstanding requests.
    pub fn quota(&self) -> QuotaStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.shared.state.lock();
        *state = State {
            grants: Some(tx),
            ..State::default()
        };
        QuotaStream {
            shared: Arc::clone(&self.shared),
            grants: rx,
            delivered: false,
        }
    }

    /// Re-evaluates pending requests on every size change. Ends when the
    /// size channel closes.
    pub async fn follow_size(self) {
        let mut size = self.shared.size.clone();
        while size.changed().await.is_ok() {
            self.shared.evaluate();
        }
        debug!("registry size channel closed; quota keeper stops following");
    }

    pub fn is_self_preserving(&self) -> bool {
        self.shared.state.lock().preserving
    }
}

impl Shared {
    fn evaluate(&self) {
        let mut state = self.state.lock();
        if state.pending == 0 || state.in_flight {
            return;
        }
        let size = *self.size.borrow();
        let steady = *state.steady.get_or_insert(size);

        if !is_eviction_allowed(size, steady, self.allowed_drop) {
            if !state.preserving {
                state.preserving = true;
                info!(
                    "entering self-preservation: registry size {} is at the limit of a {}% drop \
                     from {}",
                    size, self.allowed_drop, steady
                );
            }
            return;
        }

        let Some(grants) = state.grants.as_ref() else {
            return;
        };
        if grants.send(1).is_err() {
            state.grants = None;
            return;
        }
        state.pending -= 1;
        state.in_flight = true;
        if state.preserving {
            state.preserving = false;
            info!("leaving self-preservation at registry size {}", size);
        }
        debug!("granted eviction permit (size {}, steady {})", size, steady);
    }

    /// Called once the consumer is done with a permit.
    fn settle(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = false;
            if state.pending == 0 {
                state.steady = None;
                state.preserving = false;
            }
        }
        self.evaluate();
    }
}

/// Permit grants, one `1` per permit.
pub struct QuotaStream {
    shared: Arc<Shared>,
    grants: mpsc::UnboundedReceiver<u64>,
    delivered: bool,
}

impl QuotaStream {
    pub fn request(&self, permits: u64) {
        if permits == 0 {
            return;
        }
        self.shared.state.lock().pending += permits;
        self.shared.evaluate();
    }

    /// Withdraws up to `permits` requests that the consumer has not
    /// received yet: pending ones first, then a grant still sitting in the
    /// stream. Returns how many were withdrawn.
    pub fn cancel(&mut self, permits: u64) -> u64 {
        let mut state = self.shared.state.lock();
        let mut withdrawn = permits.min(state.pending);
        state.pending -= withdrawn;
        // in flight but not delivered: the grant is still queued
        if withdrawn < permits && state.in_flight && !self.delivered {
            if let Ok(granted) = self.grants.try_recv() {
                state.in_flight = false;
                withdrawn += granted;
                debug!("took back an eviction permit that was no longer needed");
            }
        }
        if state.pending == 0 && !state.in_flight {
            state.steady = None;
            if state.preserving {
                state.preserving = false;
                info!("leaving self-preservation: no evictions pending");
            }
        }
        withdrawn
    }

    pub fn pending(&self) -> u64 {
        self.shared.state.lock().pending
    }
}

impl Stream for QuotaStream {
    type Item = u64;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<u64>> {
        if self.delivered {
            self.delivered = false;
            self.shared.settle();
        }
        let polled = self.grants.poll_recv(cx);
        if matches!(polled, Poll::Ready(Some(_))) {
            self.delivered = true;
        }
        polled
    }
}
