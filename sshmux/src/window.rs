//! Per-channel flow-control credit, one instance per direction.

use std::sync::Mutex;

use log::{debug, trace};
use tokio::sync::Notify;

use crate::Error;

/// Smallest packet size a window will advertise.
pub const MIN_PACKET_SIZE: u32 = 32 * 1024;
/// Largest packet size a window will advertise.
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Sliding send/receive credit measured in bytes.
///
/// On the send side, [`consume`](Window::consume) suspends the writer
/// while the peer has not granted enough credit and is woken by
/// [`expand`](Window::expand) when a `SSH_MSG_CHANNEL_WINDOW_ADJUST`
/// arrives. On the receive side,
/// [`consume_and_check`](Window::consume_and_check) accounts for
/// incoming data and reports when our own grant should be re-opened.
#[derive(Debug)]
pub struct Window {
    credit: Mutex<u32>,
    notify: Notify,
    initial: u32,
    packet_size: u32,
}

impl Window {
    /// `packet_size` is clamped to
    /// [`MIN_PACKET_SIZE`]..=[`MAX_PACKET_SIZE`].
    pub fn new(size: u32, packet_size: u32) -> Window {
        Window {
            credit: Mutex::new(size),
            notify: Notify::new(),
            initial: size,
            packet_size: packet_size.clamp(MIN_PACKET_SIZE, MAX_PACKET_SIZE),
        }
    }

    pub fn size(&self) -> u32 {
        self.credit.lock().map(|c| *c).unwrap_or(0)
    }

    pub fn packet_size(&self) -> u32 {
        self.packet_size
    }

    /// Take `n` bytes of credit, suspending until enough is available.
    pub async fn consume(&self, n: u32) {
        loop {
            let notified = self.notify.notified();
            if let Ok(mut credit) = self.credit.lock() {
                if *credit >= n {
                    *credit -= n;
                    return;
                }
                trace!("window: need {} credit, have {}", n, *credit);
            }
            notified.await;
        }
    }

    /// Take at most `max` bytes of credit, but at least one byte,
    /// suspending while the window is empty. Returns the amount taken.
    pub async fn consume_up_to(&self, max: u32) -> u32 {
        loop {
            let notified = self.notify.notified();
            if let Ok(mut credit) = self.credit.lock() {
                if *credit > 0 {
                    let taken = max.min(*credit);
                    *credit -= taken;
                    return taken;
                }
            }
            notified.await;
        }
    }

    /// Receive-side accounting: take `n` bytes off the grant and, when
    /// the remainder falls below the packet size, report how much to
    /// hand back to the peer with a window adjust. Taking more than was
    /// granted is a protocol error.
    pub fn consume_and_check(&self, n: u32) -> Result<Option<u32>, Error> {
        let Ok(mut credit) = self.credit.lock() else {
            return Err(Error::Inconsistent);
        };
        if n > *credit {
            return Err(Error::WindowExceeded {
                len: n,
                window: *credit,
            });
        }
        *credit -= n;
        if *credit < self.packet_size {
            let adjust = self.initial - *credit;
            debug!("window: credit {} below packet size, re-opening by {}", *credit, adjust);
            *credit = self.initial;
            Ok(Some(adjust))
        } else {
            Ok(None)
        }
    }

    /// Add credit and wake suspended writers.
    pub fn expand(&self, n: u32) {
        if let Ok(mut credit) = self.credit.lock() {
            *credit = credit.saturating_add(n);
        }
        self.notify.notify_waiters();
    }
}
