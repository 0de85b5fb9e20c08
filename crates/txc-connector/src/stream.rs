//! Push-based pipelines over incoming connector messages.
//!
//! [`Stream`] mirrors the core of [`Iterator`] for data that is pushed rather
//! than pulled: combinators build a pipeline and [`Stream::subscribe`] installs
//! it. For the connector the source is
//! [`TransaqConnector::input_stream`](crate::TransaqConnector::input_stream)
//! and the whole pipeline runs on the connector's callback thread, so every
//! stage must be `Send`.
//!
//! ```no_run
//! use txc_connector::{Stream, TransaqConnector};
//! # fn f(txc: &mut TransaqConnector) -> txc_core::Result<()> {
//! txc.input_stream()
//!     .map(|buf| buf.to_string_lossy().into_owned())
//!     .filter(|msg| msg.starts_with("<server_status"))
//!     .subscribe(|msg| println!("{msg}"))?;
//! # Ok(()) }
//! ```

use std::fmt::Debug;

use txc_core::Result;

pub trait Stream: Sized {
    type Output;

    /// Install `f` as the sink of the pipeline.
    fn subscribe<F>(self, f: F) -> Result<()>
    where
        F: FnMut(Self::Output) + Send + 'static;

    #[inline(always)]
    fn map<F, R>(self, f: F) -> Map<Self, F>
    where
        F: FnMut(Self::Output) -> R + Send + 'static,
    {
        Map { inner: self, f }
    }

    #[inline(always)]
    fn filter<F>(self, f: F) -> Filter<Self, F>
    where
        F: FnMut(&Self::Output) -> bool + Send + 'static,
    {
        Filter { inner: self, f }
    }

    #[inline(always)]
    fn filter_map<F, T>(self, f: F) -> FilterMap<Self, F>
    where
        F: FnMut(Self::Output) -> Option<T> + Send + 'static,
    {
        FilterMap { inner: self, f }
    }

    #[inline(always)]
    fn inspect<F>(self, f: F) -> Inspect<Self, F>
    where
        F: FnMut(&Self::Output) + Send + 'static,
    {
        Inspect { inner: self, f }
    }
}

pub struct Map<S, F> {
    inner: S,
    f: F,
}

impl<S: Debug, F> Debug for Map<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").field("inner", &self.inner).finish()
    }
}

impl<S, F, R> Stream for Map<S, F>
where
    S: Stream,
    F: FnMut(S::Output) -> R + Send + 'static,
{
    type Output = R;

    #[inline(always)]
    fn subscribe<G>(self, mut g: G) -> Result<()>
    where
        G: FnMut(R) + Send + 'static,
    {
        let mut mapf = self.f;
        self.inner.subscribe(move |x| g(mapf(x)))
    }
}

pub struct Filter<S, F> {
    inner: S,
    f: F,
}

impl<S: Debug, F> Debug for Filter<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter").field("inner", &self.inner).finish()
    }
}

impl<S, F> Stream for Filter<S, F>
where
    S: Stream,
    F: FnMut(&S::Output) -> bool + Send + 'static,
{
    type Output = S::Output;

    #[inline(always)]
    fn subscribe<G>(self, mut g: G) -> Result<()>
    where
        G: FnMut(S::Output) + Send + 'static,
    {
        let mut pred = self.f;
        self.inner.subscribe(move |x| {
            if pred(&x) {
                g(x)
            }
        })
    }
}

pub struct FilterMap<S, F> {
    inner: S,
    f: F,
}

impl<S: Debug, F> Debug for FilterMap<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterMap").field("inner", &self.inner).finish()
    }
}

impl<S, F, T> Stream for FilterMap<S, F>
where
    S: Stream,
    F: FnMut(S::Output) -> Option<T> + Send + 'static,
{
    type Output = T;

    #[inline(always)]
    fn subscribe<G>(self, mut g: G) -> Result<()>
    where
        G: FnMut(T) + Send + 'static,
    {
        let mut fmap = self.f;
        self.inner.subscribe(move |x| {
            if let Some(y) = fmap(x) {
                g(y)
            }
        })
    }
}

pub struct Inspect<S, F> {
    inner: S,
    f: F,
}

impl<S: Debug, F> Debug for Inspect<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inspect").field("inner", &self.inner).finish()
    }
}

impl<S, F> Stream for Inspect<S, F>
where
    S: Stream,
    F: FnMut(&S::Output) + Send + 'static,
{
    type Output = S::Output;

    #[inline(always)]
    fn subscribe<G>(self, mut g: G) -> Result<()>
    where
        G: FnMut(S::Output) + Send + 'static,
    {
        let mut peek = self.f;
        self.inner.subscribe(move |x| {
            peek(&x);
            g(x)
        })
    }
}
