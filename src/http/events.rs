//! Client events
//!
//! Observers see the lifecycle of every request as a stream of
//! [`ClientEvent`] values, in registration order. An observer returning
//! [`Flow::Stop`] hides the event from the observers registered after it.
//! The request state machine never looks at the outcome.

use super::client::RequestId;
use super::pool::ConnectionId;
use super::{Error, Response, Status};
use std::fmt;
use url::Url;

/// Something that happened to a request
#[derive(Debug)]
pub enum ClientEvent<'a> {
    Submitted { id: RequestId, url: &'a Url },
    SocketCheckedOut { id: RequestId, connection: ConnectionId, reused: bool },
    RequestSent { id: RequestId, bytes: u64 },
    ContinueReceived { id: RequestId },
    HeadersReceived { id: RequestId, status: Status },
    Redirect { id: RequestId, from: &'a Url, to: &'a Url, status: Status },
    Response { id: RequestId, response: &'a Response },
    Error { id: RequestId, error: &'a Error },
    Cancelled { id: RequestId },
}

impl ClientEvent<'_> {
    /// The request the event belongs to
    pub fn id(&self) -> RequestId {
        match self {
            ClientEvent::Submitted { id, .. }
            | ClientEvent::SocketCheckedOut { id, .. }
            | ClientEvent::RequestSent { id, .. }
            | ClientEvent::ContinueReceived { id }
            | ClientEvent::HeadersReceived { id, .. }
            | ClientEvent::Redirect { id, .. }
            | ClientEvent::Response { id, .. }
            | ClientEvent::Error { id, .. }
            | ClientEvent::Cancelled { id } => *id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Submitted { .. } => "submitted",
            ClientEvent::SocketCheckedOut { .. } => "socket-checked-out",
            ClientEvent::RequestSent { .. } => "request-sent",
            ClientEvent::ContinueReceived { .. } => "continue-received",
            ClientEvent::HeadersReceived { .. } => "headers-received",
            ClientEvent::Redirect { .. } => "redirect",
            ClientEvent::Response { .. } => "response",
            ClientEvent::Error { .. } => "error",
            ClientEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Whether later observers see the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

type Observer = Box<dyn FnMut(&ClientEvent<'_>) -> Flow + Send>;

/// Ordered observer list
#[derive(Default)]
pub struct Observers {
    observers: Vec<Observer>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&ClientEvent<'_>) -> Flow + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Deliver an event; returns how many observers saw it
    pub fn emit(&mut self, event: &ClientEvent<'_>) -> usize {
        let mut delivered = 0;
        for observer in self.observers.iter_mut() {
            delivered += 1;
            if observer(event) == Flow::Stop {
                break;
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.observers.len())
            .finish()
    }
}
