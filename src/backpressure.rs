//! Outbound acknowledgement window.
//!
//! Every sequenced frame sent to the peer is retained, already encoded,
//! until the peer acknowledges it. The window depth drives flow control:
//! at the soft limit the sender starts probing for acknowledgements, at the
//! pause limit payload frames stop flowing, and the hard limit is a protocol
//! violation that kills the connection.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::{Gtp3Error, Result};

/// Unacknowledged-frame thresholds.
#[derive(Debug, Clone, Copy)]
pub struct WindowLimits {
    /// Depth at which acknowledgement probes start.
    pub soft: usize,
    /// Depth at which payload frames stop being sent.
    pub pause: usize,
    /// Depth that must never be exceeded.
    pub hard: usize,
}

impl Default for WindowLimits {
    fn default() -> Self {
        Self {
            soft: 16,
            pause: 64,
            hard: 128,
        }
    }
}

/// Retention window for sent-but-unacknowledged frames.
///
/// Frames are kept in send order together with their sequence number so a
/// resumed connection can retransmit them verbatim.
pub struct AckWindow {
    frames: VecDeque<(u16, Bytes)>,
    last_ack: u16,
    limits: WindowLimits,
    sent_since_probe: usize,
}

impl AckWindow {
    pub fn new(limits: WindowLimits) -> Self {
        Self {
            frames: VecDeque::new(),
            last_ack: 0,
            limits,
            sent_since_probe: 0,
        }
    }

    /// Number of frames awaiting acknowledgement.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Highest acknowledged sequence number.
    pub fn last_ack(&self) -> u16 {
        self.last_ack
    }

    /// Retain an encoded sequenced frame until the peer acknowledges it.
    ///
    /// Fails with [`Gtp3Error::AckLimitExceeded`] when the window already
    /// sits at the hard limit; the connection cannot continue past that.
    pub fn push(&mut self, seq: u16, encoded: Bytes) -> Result<()> {
        if self.frames.len() >= self.limits.hard {
            return Err(Gtp3Error::AckLimitExceeded);
        }
        self.frames.push_back((seq, encoded));
        self.sent_since_probe += 1;
        Ok(())
    }

    /// Process a cumulative acknowledgement up to `seq`.
    ///
    /// Sequence numbers wrap at u16; a frame is covered when its seq lies
    /// in the wrap-aware interval between the previous ack mark (exclusive)
    /// and the acked seq (inclusive).
    pub fn ack(&mut self, seq: u16) {
        let wrapped = seq < self.last_ack;
        while let Some(&(frame_seq, _)) = self.frames.front() {
            let covered = if wrapped {
                frame_seq > self.last_ack || frame_seq <= seq
            } else {
                frame_seq > self.last_ack && frame_seq <= seq
            };
            if covered {
                self.frames.pop_front();
            } else {
                break;
            }
        }
        self.last_ack = seq;
    }

    /// True when payload frames must stop until the window drains.
    pub fn should_pause(&self) -> bool {
        self.frames.len() >= self.limits.pause
    }

    /// True when a paused sender may start sending payload frames again.
    pub fn can_resume(&self) -> bool {
        self.frames.len() < self.limits.soft
    }

    /// Decide whether to probe the peer for an acknowledgement.
    ///
    /// Probes fire once the window reaches the soft limit, then back off
    /// until `cooldown` further frames have been sent.
    pub fn should_request_ack(&mut self, cooldown: usize) -> bool {
        if self.frames.len() >= self.limits.soft && self.sent_since_probe >= cooldown {
            self.sent_since_probe = 0;
            true
        } else {
            false
        }
    }

    /// Unacknowledged frames in send order, for retransmission.
    pub fn frames(&self) -> impl Iterator<Item = &Bytes> {
        self.frames.iter().map(|(_, encoded)| encoded)
    }

    /// Drop everything, including the ack mark.
    pub fn clear(&mut self) {
        self.frames.clear();
        self.last_ack = 0;
        self.sent_since_probe = 0;
    }
}
