use futures::prelude::*;
use kube::{api::DynamicObject, runtime::watcher};
pub use kube::runtime::watcher::Event;
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

pub type WatchStream =
    Pin<Box<dyn Stream<Item = watcher::Result<Event<DynamicObject>>> + Send + 'static>>;

/// Wraps a watch event stream, riding out errors.
pub struct Watch {
    span: tracing::Span,
    rx: WatchStream,
}

// === impl Watch ===

impl Watch {
    pub fn new(rx: WatchStream) -> Self {
        Self {
            rx,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Receives the next event in the stream.
    ///
    /// Errors are logged and followed by a one second pause before the
    /// watch is polled again. Returns `None` once the stream ends.
    pub async fn recv(&mut self) -> Option<Event<DynamicObject>> {
        loop {
            match self.rx.next().instrument(self.span.clone()).await? {
                Ok(ev) => return Some(ev),
                Err(error) => {
                    info!(parent: &self.span, %error, "Watch failed");
                    time::sleep(time::Duration::from_secs(1)).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }
}
