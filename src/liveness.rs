//! Channel liveness state machine.
//!
//! `Alive → Closing → Closed`, with deadline expiry short-circuiting
//! straight to teardown. In v3 the client pings and each PING re-arms the
//! idle deadline; in v4 the server pings and PONG receipt re-arms it. Both
//! directions use the same window: `ping_interval + ping_timeout`.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Alive,
    Closing,
    Closed,
}

#[derive(Debug)]
pub struct Liveness {
    state: State,
    deadline: Instant,
    window: Duration,
}

impl Liveness {
    pub fn new(ping_interval: Duration, ping_timeout: Duration) -> Self {
        let window = ping_interval + ping_timeout;
        Self {
            state: State::Alive,
            deadline: Instant::now() + window,
            window,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == State::Alive
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Re-arm the idle deadline: PING receipt in v3, PONG receipt in v4.
    pub fn refresh(&mut self) {
        self.deadline = Instant::now() + self.window;
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// `Alive → Closing`. Returns false when teardown has already started,
    /// so only one caller runs the close sequence.
    pub fn begin_close(&mut self) -> bool {
        if self.state == State::Alive {
            self.state = State::Closing;
            true
        } else {
            false
        }
    }

    pub fn finish_close(&mut self) {
        self.state = State::Closed;
    }
}
