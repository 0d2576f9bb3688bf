//! Streaming relay of upstream response bodies.
//!
//! Chunks are forwarded to the client as they arrive; the body is never
//! buffered. A capture tap observes every chunk and is completed only when
//! the upstream body ends cleanly.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use hyper::body::{Body, Bytes};
use tokio::time::{Instant, Sleep};

use crate::extractor::PendingCapture;

/// Stream over an upstream body with an idle deadline between frames.
pub struct RelayStream<B> {
    body: B,
    idle: Duration,
    deadline: Pin<Box<Sleep>>,
    tap: Option<PendingCapture>,
    done: bool,
}

impl<B> RelayStream<B> {
    /// Relays `body`, failing if no frame arrives within `idle`.
    pub fn new(body: B, idle: Duration, tap: Option<PendingCapture>) -> Self {
        Self {
            body,
            idle,
            deadline: Box::pin(tokio::time::sleep(idle)),
            tap,
            done: false,
        }
    }

    fn fail(&mut self, error: io::Error) -> Poll<Option<io::Result<Bytes>>> {
        self.done = true;
        if let Some(tap) = self.tap.take() {
            tracing::debug!("Relay of {} failed, capture dropped", tap.candidate().url);
        }
        Poll::Ready(Some(Err(error)))
    }
}

impl<B> Stream for RelayStream<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::fmt::Display,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        loop {
            match Pin::new(&mut this.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    let idle = this.idle;
                    this.deadline.as_mut().reset(Instant::now() + idle);
                    // Trailers are not relayed.
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if let Some(tap) = this.tap.as_mut() {
                        tap.observe(&data);
                    }
                    return Poll::Ready(Some(Ok(data)));
                }
                Poll::Ready(Some(Err(e))) => {
                    return this.fail(io::Error::other(e.to_string()));
                }
                Poll::Ready(None) => {
                    this.done = true;
                    if let Some(tap) = this.tap.take() {
                        tap.complete();
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => break,
            }
        }

        match this.deadline.as_mut().poll(cx) {
            Poll::Ready(()) => this.fail(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream body stalled",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}
