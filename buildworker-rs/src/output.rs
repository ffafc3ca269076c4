//! Deferred values.
//!
//! Many values in a provisioning run only exist once a remote create call has
//! returned: the address assigned to a public IP, the identifier of a network
//! interface, and so on. An [`Output`] is a handle to such a value. Dependent
//! computations are expressed up front through combinators ([`Output::map`],
//! [`Output::and_then`], [`Output::zip`], ...) and run once their inputs are
//! available. Nothing in this crate blocks on an output outside of the
//! [`engine`](crate::engine) and the final result set.
//!
//! During a preview, a provider may not know a value at all. Such outputs
//! resolve to [`Resolved::Unknown`], and every output derived from them stays
//! unknown as well.

use std::fmt;
use std::future::Future;

use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A deferred value failed to resolve.
///
/// This type is `Clone`, as a single failure is observed by every output
/// depending on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DependencyError {
    #[error("resource {resource} failed: {message}")]
    ResourceFailed { resource: String, message: String },

    #[error("resource {resource} has no output attribute `{attribute}`")]
    MissingAttribute { resource: String, attribute: String },

    #[error("output attribute `{attribute}` of resource {resource} is malformed: {message}")]
    MalformedAttribute {
        resource: String,
        attribute: String,
        message: String,
    },

    #[error("could not derive {what}: {message}")]
    Derivation { what: &'static str, message: String },

    #[error("registration of resource {resource} did not complete: {message}")]
    TaskLost { resource: String, message: String },
}

/// The settled state of an [`Output`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum Resolved<T> {
    Known(T),
    Unknown,
}

impl<T> Resolved<T> {
    pub fn known(self) -> Option<T> {
        match self {
            Resolved::Known(v) => Some(v),
            Resolved::Unknown => None,
        }
    }

    pub fn as_known(&self) -> Option<&T> {
        match self {
            Resolved::Known(v) => Some(v),
            Resolved::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Resolved::Known(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        match self {
            Resolved::Known(v) => Resolved::Known(f(v)),
            Resolved::Unknown => Resolved::Unknown,
        }
    }
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<Resolved<T>, DependencyError>>>;

/// Handle to a value that may not be known yet.
///
/// Cloning an output is cheap; all clones observe the same, single
/// resolution.
pub struct Output<T: Clone> {
    inner: SharedResult<T>,
}

impl<T: Clone> Clone for Output<T> {
    fn clone(&self) -> Self {
        Output {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for Output<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.peek() {
            Some(Ok(resolved)) => write!(f, "Output({resolved:?})"),
            Some(Err(e)) => write!(f, "Output(failed: {e})"),
            None => f.write_str("Output(<pending>)"),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Output<T> {
    fn settled(result: Result<Resolved<T>, DependencyError>) -> Self {
        Output {
            inner: future::ready(result).boxed().shared(),
        }
    }

    /// An output whose value is available immediately.
    pub fn known(value: T) -> Self {
        Self::settled(Ok(Resolved::Known(value)))
    }

    /// An output that will never be known in this run (preview).
    pub fn unknown() -> Self {
        Self::settled(Ok(Resolved::Unknown))
    }

    pub fn failed(error: DependencyError) -> Self {
        Self::settled(Err(error))
    }

    pub fn from_future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Resolved<T>, DependencyError>> + Send + 'static,
    {
        Output {
            inner: fut.boxed().shared(),
        }
    }

    pub fn map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let inner = self.inner.clone();
        Output::from_future(async move { Ok(inner.await?.map(f)) })
    }

    /// Like [`map`](Output::map), for derivations that can fail.
    pub fn try_map<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Result<U, DependencyError> + Send + 'static,
    {
        let inner = self.inner.clone();
        Output::from_future(async move {
            match inner.await? {
                Resolved::Known(v) => f(v).map(Resolved::Known),
                Resolved::Unknown => Ok(Resolved::Unknown),
            }
        })
    }

    /// Continue with another deferred computation once this value is known.
    pub fn and_then<U, F>(&self, f: F) -> Output<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Output<U> + Send + 'static,
    {
        let inner = self.inner.clone();
        Output::from_future(async move {
            match inner.await? {
                Resolved::Known(v) => f(v).inner.await,
                Resolved::Unknown => Ok(Resolved::Unknown),
            }
        })
    }

    pub fn zip<U>(&self, other: &Output<U>) -> Output<(T, U)>
    where
        U: Clone + Send + Sync + 'static,
    {
        let (a, b) = (self.inner.clone(), other.inner.clone());
        Output::from_future(async move {
            let (a, b) = future::join(a, b).await;
            match (a?, b?) {
                (Resolved::Known(a), Resolved::Known(b)) => Ok(Resolved::Known((a, b))),
                _ => Ok(Resolved::Unknown),
            }
        })
    }

    /// Replace an unknown value with `default`. Failures are passed through.
    pub fn unwrap_or(&self, default: T) -> Output<T> {
        let inner = self.inner.clone();
        Output::from_future(async move {
            match inner.await? {
                Resolved::Unknown => Ok(Resolved::Known(default)),
                known => Ok(known),
            }
        })
    }

    /// Wait for this output to settle.
    pub async fn resolve(&self) -> Result<Resolved<T>, DependencyError> {
        self.inner.clone().await
    }
}

/// Combine a list of outputs. The result is unknown if any input is unknown.
pub fn all<T, I>(outputs: I) -> Output<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = Output<T>>,
{
    let inners: Vec<_> = outputs.into_iter().map(|o| o.inner).collect();
    Output::from_future(async move {
        let mut values = Vec::with_capacity(inners.len());
        let mut unknown = false;
        for resolved in future::join_all(inners).await {
            match resolved? {
                Resolved::Known(v) => values.push(v),
                Resolved::Unknown => unknown = true,
            }
        }

        if unknown {
            Ok(Resolved::Unknown)
        } else {
            Ok(Resolved::Known(values))
        }
    })
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn map_and_zip_known_values() {
        let ip = Output::known("1.2.3.4".to_string());
        let domain = ip.map(|ip| format!("{ip}.sslip.io"));
        let both = ip.zip(&domain);

        assert_eq!(
            both.resolve().await.unwrap(),
            Resolved::Known(("1.2.3.4".to_string(), "1.2.3.4.sslip.io".to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_propagates_without_evaluating() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_map = calls.clone();

        let ip: Output<String> = Output::unknown();
        let derived = ip.map(move |ip| {
            calls_map.fetch_add(1, Ordering::SeqCst);
            ip.len()
        });

        assert_eq!(derived.resolve().await.unwrap(), Resolved::Unknown);
        assert_eq!(
            derived.zip(&Output::known(1)).resolve().await.unwrap(),
            Resolved::Unknown
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unwrap_or_degrades_unknown_only() {
        let unknown: Output<String> = Output::unknown();
        assert_eq!(
            unknown.unwrap_or(String::new()).resolve().await.unwrap(),
            Resolved::Known(String::new())
        );

        let failed: Output<String> = Output::failed(DependencyError::Derivation {
            what: "test value",
            message: "boom".into(),
        });
        assert!(failed.unwrap_or(String::new()).resolve().await.is_err());
    }

    #[tokio::test]
    async fn and_then_and_try_map() {
        let base = Output::known(2u32);
        let chained = base.and_then(|v| Output::known(v * 10));
        assert_eq!(chained.resolve().await.unwrap(), Resolved::Known(20));

        let rejected = base.try_map(|_| -> Result<u32, DependencyError> {
            Err(DependencyError::Derivation {
                what: "test value",
                message: "rejected".into(),
            })
        });
        assert!(matches!(
            rejected.resolve().await,
            Err(DependencyError::Derivation { .. })
        ));
    }

    #[tokio::test]
    async fn resolves_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_fut = calls.clone();
        let out = Output::from_future(async move {
            calls_fut.fetch_add(1, Ordering::SeqCst);
            Ok(Resolved::Known(7u8))
        });

        let a = out.map(|v| v + 1);
        let b = out.map(|v| v + 2);
        assert_eq!(a.resolve().await.unwrap(), Resolved::Known(8));
        assert_eq!(b.resolve().await.unwrap(), Resolved::Known(9));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn all_collects_in_order() {
        let outs = vec![Output::known(1), Output::known(2), Output::known(3)];
        assert_eq!(
            all(outs).resolve().await.unwrap(),
            Resolved::Known(vec![1, 2, 3])
        );

        let partial = vec![Output::known(1), Output::unknown()];
        assert_eq!(all(partial).resolve().await.unwrap(), Resolved::Unknown);
    }
}
