//! Readiness reactor
//!
//! A thin layer over `poll(2)` for many descriptors at once, plus a timer
//! table. Each scheduling pass registers the descriptors its requests are
//! blocked on, waits once, and gets back which tokens became ready.
//!
//! Timers are keyed so they can be cancelled when a request finishes or is
//! abandoned; nothing stays registered for a request that no longer exists.

use super::session::{timeout_millis, PollEvents};
use super::{Error, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// Multi-descriptor poller
pub struct Reactor<T> {
    tokens: Vec<T>,
    fds: Vec<libc::pollfd>,
    woken: Vec<T>,
}

impl<T: Copy> Reactor<T> {
    pub fn new() -> Self {
        Reactor {
            tokens: Vec::new(),
            fds: Vec::new(),
            woken: Vec::new(),
        }
    }

    /// Wait for `events` on `fd` in the next poll
    pub fn register(&mut self, token: T, fd: RawFd, events: PollEvents) {
        self.tokens.push(token);
        self.fds.push(libc::pollfd {
            fd,
            events: events.as_poll_flags(),
            revents: 0,
        });
    }

    /// Report `token` readable in the next poll without consulting the
    /// descriptor, e.g. for bytes already decrypted by TLS
    pub fn wake(&mut self, token: T) {
        self.woken.push(token);
    }

    /// Number of registrations for the next poll
    pub fn len(&self) -> usize {
        self.fds.len() + self.woken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all registrations
    pub fn clear(&mut self) {
        self.tokens.clear();
        self.fds.clear();
        self.woken.clear();
    }

    /// Wait up to `timeout`, drain the registrations and return the tokens
    /// whose descriptors reported any event
    ///
    /// Errors and hang-ups count as ready; the owner finds out what happened
    /// on its next read, write or connect step. Woken tokens make the wait
    /// non-blocking. With nothing registered the call sleeps for the
    /// timeout, which must then be bounded.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<T>> {
        let mut ready: Vec<T> = self.woken.drain(..).collect();

        let timeout = if ready.is_empty() {
            timeout
        } else {
            Some(Duration::ZERO)
        };

        if self.fds.is_empty() {
            if let Some(wait) = timeout {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
            self.clear();
            return Ok(ready);
        }

        let n = loop {
            let result = unsafe {
                libc::poll(
                    self.fds.as_mut_ptr(),
                    self.fds.len() as libc::nfds_t,
                    timeout_millis(timeout),
                )
            };
            if result >= 0 {
                break result;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                self.clear();
                return Err(Error::Io(err));
            }
        };

        if n > 0 {
            let fired = self
                .tokens
                .iter()
                .zip(self.fds.iter())
                .filter(|(_, pfd)| pfd.revents != 0)
                .map(|(token, _)| *token);
            ready.extend(fired);
        }

        self.clear();
        Ok(ready)
    }
}

impl<T: Copy> Default for Reactor<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a timer was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bound on the current connect step: lookup and TCP connect, then the
    /// TLS handshake
    Connect,
    /// Bound on the whole exchange, from checkout to completion
    Transfer,
    /// Delay before a paused body is sent without `100 Continue`
    ContinueDelay,
}

/// Deadline table keyed by owner and kind
#[derive(Debug)]
pub struct Timers<K> {
    deadlines: HashMap<(K, TimerKind), Instant>,
}

impl<K: Copy + Eq + Hash> Timers<K> {
    pub fn new() -> Self {
        Timers {
            deadlines: HashMap::new(),
        }
    }

    /// Arm or re-arm a timer
    pub fn schedule(&mut self, owner: K, kind: TimerKind, deadline: Instant) {
        self.deadlines.insert((owner, kind), deadline);
    }

    pub fn cancel(&mut self, owner: K, kind: TimerKind) -> bool {
        self.deadlines.remove(&(owner, kind)).is_some()
    }

    /// Cancel every timer of `owner`
    pub fn cancel_all(&mut self, owner: K) -> usize {
        let before = self.deadlines.len();
        self.deadlines.retain(|(k, _), _| *k != owner);
        before - self.deadlines.len()
    }

    pub fn deadline(&self, owner: K, kind: TimerKind) -> Option<Instant> {
        self.deadlines.get(&(owner, kind)).copied()
    }

    /// Earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Time until the earliest deadline, zero when already due
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Remove and return the timers due at `now`, earliest first
    pub fn expired(&mut self, now: Instant) -> Vec<(K, TimerKind)> {
        let mut due: Vec<((K, TimerKind), Instant)> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, deadline)| (*key, *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);

        for (key, _) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(key, _)| key).collect()
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

impl<K: Copy + Eq + Hash> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}
