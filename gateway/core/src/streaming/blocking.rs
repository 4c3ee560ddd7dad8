//! Blocking iterator adapter

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::inference::InferenceError;

/// Event yielded by a [`BlockingTokenStream`]
#[derive(Debug)]
pub enum AdapterEvent {
    /// Next fragment from the underlying iterator
    Token(String),
    /// The iterator failed; no further events follow
    Failed(InferenceError),
}

/// Result of one pull on the blocking pool.
///
/// `Done` is the end-of-sequence sentinel: normal completion never travels
/// through the error path.
enum Pull<I> {
    Token(I, String),
    Done,
    Failed(InferenceError),
}

fn pull<I>(mut iter: I) -> Pull<I>
where
    I: Iterator<Item = Result<String, InferenceError>>,
{
    match iter.next() {
        Some(Ok(token)) => Pull::Token(iter, token),
        Some(Err(e)) => Pull::Failed(e),
        None => Pull::Done,
    }
}

enum State<I> {
    Ready(I),
    Pulling(JoinHandle<Pull<I>>),
    Finished,
}

/// Non-blocking stream over a blocking token iterator.
///
/// Pulls are lazy: nothing runs until the stream is polled, and at most one
/// pull is in flight at a time. The stream is single-use.
pub struct BlockingTokenStream<I> {
    state: State<I>,
}

impl<I> BlockingTokenStream<I>
where
    I: Iterator<Item = Result<String, InferenceError>> + Send + Unpin + 'static,
{
    /// Wrap `iter`. Must be polled from within a tokio runtime.
    pub fn new(iter: I) -> Self {
        Self {
            state: State::Ready(iter),
        }
    }

    /// Whether the sequence has ended (normally or with an error)
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Finished)
    }
}

impl<I> Stream for BlockingTokenStream<I>
where
    I: Iterator<Item = Result<String, InferenceError>> + Send + Unpin + 'static,
{
    type Item = AdapterEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, State::Finished) {
                State::Ready(iter) => {
                    this.state = State::Pulling(tokio::task::spawn_blocking(move || pull(iter)));
                }
                State::Pulling(mut handle) => {
                    return match Pin::new(&mut handle).poll(cx) {
                        Poll::Pending => {
                            this.state = State::Pulling(handle);
                            Poll::Pending
                        }
                        Poll::Ready(Ok(Pull::Token(iter, token))) => {
                            this.state = State::Ready(iter);
                            Poll::Ready(Some(AdapterEvent::Token(token)))
                        }
                        Poll::Ready(Ok(Pull::Done)) => Poll::Ready(None),
                        Poll::Ready(Ok(Pull::Failed(e))) => {
                            Poll::Ready(Some(AdapterEvent::Failed(e)))
                        }
                        Poll::Ready(Err(join_err)) => {
                            warn!(error = %join_err, "Inference pull did not complete");
                            Poll::Ready(Some(AdapterEvent::Failed(InferenceError::Protocol(
                                format!("inference worker failed: {join_err}"),
                            ))))
                        }
                    };
                }
                State::Finished => return Poll::Ready(None),
            }
        }
    }
}
