use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// Wraps a future and logs how long it took from first poll to completion. The events are
/// debug level under this module's target, `log::init` enables them when `LOG_PERF` is set.
#[pin_project]
pub struct Timed<Fut>
where
    Fut: Future,
{
    #[pin]
    inner: Fut,
    label: &'static str,
    start: Option<Instant>,
}

impl<Fut> Future for Timed<Fut>
where
    Fut: Future,
{
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.project();
        let start = this.start.get_or_insert_with(Instant::now);

        let output = match this.inner.poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(output) => output,
        };

        tracing::debug!(label = *this.label, elapsed = ?start.elapsed(), "timed future done");

        Poll::Ready(output)
    }
}

pub trait TimedExt: Sized + Future {
    fn timed(self, label: &'static str) -> Timed<Self> {
        Timed {
            inner: self,
            label,
            start: None,
        }
    }
}

impl<F: Future> TimedExt for F {}
