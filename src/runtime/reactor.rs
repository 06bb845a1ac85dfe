//! Services the event loop provides to a connection.

use std::time::Instant;

/// Handle through which a connection acts on its transport and timer.
///
/// Passed into every callback; a connection never holds on to it.
pub trait Reactor {
    /// Queue bytes for transmission.
    fn send(&mut self, data: &[u8]);

    /// Arm the connection's single timer, replacing any armed deadline.
    fn arm_timer(&mut self, deadline: Instant);

    /// Deadline of the currently armed timer.
    fn timer(&self) -> Option<Instant>;

    fn cancel_timer(&mut self);

    /// Close the transport, drop unsent output and connect again.
    fn reconnect(&mut self);

    /// Dispatch priority; lower values are serviced first.
    fn set_priority(&mut self, priority: u8);
}

/// Reactor that records what a connection asked of it.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockReactor {
    pub sent: bytes::BytesMut,
    pub timer: Option<Instant>,
    pub reconnects: usize,
    pub priority: Option<u8>,
}

#[cfg(test)]
impl MockReactor {
    /// Take everything sent so far as a string.
    pub fn take_sent(&mut self) -> String {
        let sent = self.sent.split();
        String::from_utf8_lossy(&sent).into_owned()
    }
}

#[cfg(test)]
impl Reactor for MockReactor {
    fn send(&mut self, data: &[u8]) {
        self.sent.extend_from_slice(data);
    }

    fn arm_timer(&mut self, deadline: Instant) {
        self.timer = Some(deadline);
    }

    fn timer(&self) -> Option<Instant> {
        self.timer
    }

    fn cancel_timer(&mut self) {
        self.timer = None;
    }

    fn reconnect(&mut self) {
        self.sent.clear();
        self.timer = None;
        self.reconnects += 1;
    }

    fn set_priority(&mut self, priority: u8) {
        self.priority = Some(priority);
    }
}
