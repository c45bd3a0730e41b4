use std::sync::atomic::{AtomicUsize, Ordering};

use seal_dns_lib::MAX_DNS_PACKET_SIZE;

const INITIAL_MIN_QUESTION_SIZE: usize = 512;

/// Moving estimate of the padded query size the upstream accepts over
/// UDP. DNSCrypt servers never send a UDP response larger than the
/// padded query, so this value doubles as the response-size ceiling:
/// seeing a truncated response means the ceiling must be raised.
pub struct QuestionSizeEstimator {
    min_question_size: AtomicUsize,
}

impl Default for QuestionSizeEstimator {
    fn default() -> Self {
        QuestionSizeEstimator {
            min_question_size: AtomicUsize::new(INITIAL_MIN_QUESTION_SIZE),
        }
    }
}

impl QuestionSizeEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_question_size(&self) -> usize {
        self.min_question_size.load(Ordering::Relaxed)
    }

    /// Raises the estimate to cover an observed response (overhead
    /// included), capped at the maximum packet size.
    pub fn adjust(&self, observed: usize) {
        self.min_question_size
            .fetch_max(observed.min(MAX_DNS_PACKET_SIZE), Ordering::Relaxed);
    }

    /// Doubles the estimate after a truncated response, without a
    /// numeric observation to go by.
    pub fn blind_adjust(&self) {
        let _ = self
            .min_question_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |size| {
                Some((size * 2).min(MAX_DNS_PACKET_SIZE))
            });
    }
}
