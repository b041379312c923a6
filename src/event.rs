//! # Event
//!
//! In-memory fan-out of record events to live subscribers. Events for a
//! tenant are delivered in emit order; delivery is best-effort with no
//! persistence. Closing a subscription stops future deliveries without
//! cancelling one already dispatched.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use crate::messages::MessagesFilter;
use crate::records::RecordsFilter;
use crate::store::{Entry, EntryType};

/// An event carried by the stream: a store entry with its indexes.
pub type Event = Entry;

/// Filter to use when subscribing to events.
#[derive(Clone, Debug)]
pub enum SubscribeFilter {
    /// Match events against message filters (any interface).
    Messages(Vec<MessagesFilter>),

    /// Match record events against records filters.
    Records(Vec<RecordsFilter>),
}

impl Default for SubscribeFilter {
    fn default() -> Self {
        Self::Messages(Vec::default())
    }
}

impl SubscribeFilter {
    /// Check whether the event matches the filter.
    #[must_use]
    pub fn is_match(&self, event: &Event) -> bool {
        match self {
            Self::Messages(filters) => {
                filters.is_empty() || filters.iter().any(|f| f.is_match(&event.indexes))
            }
            Self::Records(filters) => {
                // records subscriptions never observe configure events
                if matches!(event.message, EntryType::Configure(_)) {
                    return false;
                }
                filters.is_empty() || filters.iter().any(|f| f.is_match(&event.indexes))
            }
        }
    }
}

/// A handle to an open subscription, yielding matching events as a
/// stream.
pub struct Subscriber {
    inner: Pin<Box<dyn Stream<Item = Event> + Send>>,
    closed: bool,
}

impl Default for Subscriber {
    fn default() -> Self {
        Self {
            inner: Box::pin(futures::stream::empty()),
            closed: false,
        }
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber").field("closed", &self.closed).finish()
    }
}

impl Subscriber {
    /// Wrap a provider's subscription stream.
    #[must_use]
    pub fn new(stream: Pin<Box<dyn Stream<Item = Event> + Send>>) -> Self {
        Self {
            inner: stream,
            closed: false,
        }
    }

    /// Close the subscription. No further events are delivered after this
    /// call returns.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

impl Stream for Subscriber {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.inner.as_mut().poll_next(cx)
    }
}
