//! Dataflow combinators the evaluator is built from.
//!
//! Every expression evaluates to a [`ValStream`]. Operands are merged with
//! [`combine_latest`], dependent evaluations are chained with
//! [`switch_map`] (a new upstream item cancels the stale downstream work),
//! and results pass through [`distinct_until_changed`] so consumers only
//! see changes. Cancellation is by drop: dropping a combined stream drops
//! every stream it owns.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use pin_project_lite::pin_project;
use tracing::warn;

use crate::error::EvalError;
use crate::value::Val;

/// A live sequence of values produced by an expression.
pub type ValStream = BoxStream<'static, Val>;

/// A stream that emits `value` once and then stays subscribed.
///
/// Sources that never change use this so that a consumer bounded by the
/// source's lifetime keeps its subscription until it is dropped.
pub fn once_then_pending<T: Send + 'static>(value: T) -> BoxStream<'static, T> {
    stream::once(future::ready(value))
        .chain(stream::pending())
        .boxed()
}

/// A single value stream that completes after emitting.
pub fn just<T: Send + 'static>(value: T) -> BoxStream<'static, T> {
    stream::once(future::ready(value)).boxed()
}

/// Emit the latest item of every input, once each input has produced one.
///
/// Emits again whenever any input produces a new item. An empty input list
/// emits a single empty vector.
pub fn combine_latest<T>(streams: Vec<BoxStream<'static, T>>) -> BoxStream<'static, Vec<T>>
where
    T: Clone + Send + 'static,
{
    let arity = streams.len();
    if arity == 0 {
        return just(Vec::new());
    }
    let indexed = streams
        .into_iter()
        .enumerate()
        .map(|(slot, s)| s.map(move |item| (slot, item)).boxed());

    stream::select_all(indexed)
        .scan(vec![None; arity], |latest, (slot, item)| {
            latest[slot] = Some(item);
            let snapshot: Option<Vec<T>> = latest.iter().cloned().collect();
            future::ready(Some(snapshot))
        })
        .filter_map(future::ready)
        .boxed()
}

/// Suppress consecutive items equal to the previously emitted one.
pub fn distinct_until_changed<T>(source: BoxStream<'static, T>) -> BoxStream<'static, T>
where
    T: PartialEq + Clone + Send + 'static,
{
    source
        .scan(None::<T>, |last, item| {
            let changed = last.as_ref() != Some(&item);
            if changed {
                *last = Some(item.clone());
            }
            future::ready(Some(changed.then_some(item)))
        })
        .filter_map(future::ready)
        .boxed()
}

pin_project! {
    /// Stream returned by [`switch_map`] and [`switch_map_bounded`].
    pub struct SwitchMap<T, U, F> {
        source: Option<BoxStream<'static, T>>,
        inner: Option<BoxStream<'static, U>>,
        project: F,
        bounded: bool,
    }
}

impl<T, U, F> Stream for SwitchMap<T, U, F>
where
    F: FnMut(T) -> BoxStream<'static, U>,
{
    type Item = U;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<U>> {
        let this = self.project();

        // Drain the source first: only its most recent item gets an inner stream.
        if let Some(source) = this.source.as_mut() {
            loop {
                match source.poll_next_unpin(cx) {
                    Poll::Ready(Some(item)) => *this.inner = Some((this.project)(item)),
                    Poll::Ready(None) => {
                        *this.source = None;
                        if *this.bounded {
                            *this.inner = None;
                            return Poll::Ready(None);
                        }
                        break;
                    }
                    Poll::Pending => break,
                }
            }
        }

        if let Some(inner) = this.inner.as_mut() {
            match inner.poll_next_unpin(cx) {
                Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
                Poll::Ready(None) => *this.inner = None,
                Poll::Pending => {}
            }
        }

        if this.source.is_none() && this.inner.is_none() {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

/// Map every source item to a stream and forward only the newest one.
///
/// Completes once the source and the current inner stream have completed.
pub fn switch_map<T, U, F>(source: BoxStream<'static, T>, project: F) -> BoxStream<'static, U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> BoxStream<'static, U> + Send + 'static,
{
    SwitchMap {
        source: Some(source),
        inner: None,
        project,
        bounded: false,
    }
    .boxed()
}

/// Like [`switch_map`] but completes as soon as the source completes,
/// dropping the current inner stream.
pub fn switch_map_bounded<T, U, F>(
    source: BoxStream<'static, T>,
    project: F,
) -> BoxStream<'static, U>
where
    T: Send + 'static,
    U: Send + 'static,
    F: FnMut(T) -> BoxStream<'static, U> + Send + 'static,
{
    SwitchMap {
        source: Some(source),
        inner: None,
        project,
        bounded: true,
    }
    .boxed()
}

/// Emit an [`EvalError::AttributeTimeout`] if `source` has not produced a
/// value within `timeout`; later values are forwarded as they arrive.
pub fn with_initial_timeout(source: ValStream, name: String, timeout: Duration) -> ValStream {
    stream::once(async move {
        let mut source = source;
        match tokio::time::timeout(timeout, source.next()).await {
            Ok(Some(first)) => stream::once(future::ready(first)).chain(source).boxed(),
            Ok(None) => stream::empty().boxed(),
            Err(_) => {
                let millis = timeout.as_millis() as u64;
                warn!(attribute = %name, millis, "attribute finder timed out");
                let err = Val::Error(EvalError::AttributeTimeout { name, millis });
                stream::once(future::ready(err)).chain(source).boxed()
            }
        }
    })
    .flatten()
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn combine_latest_waits_for_every_slot() {
        let (tx_a, rx_a) = mpsc::unbounded::<i32>();
        let (tx_b, rx_b) = mpsc::unbounded::<i32>();
        let mut combined = combine_latest(vec![rx_a.boxed(), rx_b.boxed()]);

        tx_a.unbounded_send(1).unwrap();
        let waiting = tokio::time::timeout(Duration::from_millis(20), combined.next()).await;
        assert!(waiting.is_err());

        tx_b.unbounded_send(10).unwrap();
        assert_eq!(combined.next().await, Some(vec![1, 10]));

        tx_b.unbounded_send(20).unwrap();
        assert_eq!(combined.next().await, Some(vec![1, 20]));

        tx_a.unbounded_send(2).unwrap();
        assert_eq!(combined.next().await, Some(vec![2, 20]));

        drop(tx_a);
        drop(tx_b);
        assert_eq!(combined.next().await, None);
    }

    #[tokio::test]
    async fn combine_latest_of_nothing_emits_empty() {
        let items: Vec<Vec<i32>> = combine_latest(Vec::new()).collect().await;
        assert_eq!(items, vec![Vec::<i32>::new()]);
    }

    #[tokio::test]
    async fn distinct_suppresses_consecutive_duplicates() {
        let source = stream::iter(vec![1, 1, 2, 2, 1, 3, 3]).boxed();
        let items: Vec<i32> = distinct_until_changed(source).collect().await;
        assert_eq!(items, vec![1, 2, 1, 3]);
    }

    #[tokio::test]
    async fn switch_map_collapses_to_latest_source_item() {
        let source = stream::iter(vec![1, 2, 3]).boxed();
        let items: Vec<i32> = switch_map(source, |x| just(x * 10)).collect().await;
        assert_eq!(items, vec![30]);
    }

    #[tokio::test]
    async fn switch_map_drops_stale_inner_stream() {
        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded::<i32>();
        let counter = dropped.clone();
        let mut switched = switch_map(rx.boxed(), move |x| {
            let guard = Guard(counter.clone());
            stream::once(future::ready(x))
                .chain(stream::pending())
                .map(move |v| {
                    let _keep = &guard;
                    v
                })
                .boxed()
        });

        tx.unbounded_send(1).unwrap();
        assert_eq!(switched.next().await, Some(1));
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        tx.unbounded_send(2).unwrap();
        assert_eq!(switched.next().await, Some(2));
        assert_eq!(dropped.load(Ordering::SeqCst), 1);

        drop(switched);
        assert_eq!(dropped.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn bounded_switch_map_ends_with_source() {
        let source = stream::iter(vec![1]).boxed();
        let items: Vec<i32> = switch_map_bounded(source, |x| once_then_pending(x))
            .collect()
            .await;
        // The source completes in the same poll that delivered its only item.
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn unbounded_switch_map_outlives_source() {
        let source = stream::iter(vec![1]).boxed();
        let mut switched = switch_map(source, |x| once_then_pending(x));
        assert_eq!(switched.next().await, Some(1));
    }

    #[tokio::test]
    async fn initial_timeout_emits_error_then_forwards() {
        let (tx, rx) = mpsc::unbounded::<Val>();
        let mut s = with_initial_timeout(rx.boxed(), "pip.slow".to_string(), Duration::from_millis(20));
        match s.next().await {
            Some(Val::Error(EvalError::AttributeTimeout { name, millis })) => {
                assert_eq!(name, "pip.slow");
                assert_eq!(millis, 20);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        tx.unbounded_send(Val::of(1)).unwrap();
        assert_eq!(s.next().await, Some(Val::of(1)));
    }

    #[tokio::test]
    async fn initial_timeout_passes_prompt_values() {
        let source = stream::iter(vec![Val::TRUE, Val::FALSE]).boxed();
        let items: Vec<Val> = with_initial_timeout(source, "pip.fast".to_string(), Duration::from_secs(5))
            .collect()
            .await;
        assert_eq!(items, vec![Val::TRUE, Val::FALSE]);
    }
}
