//! Ordered transformation chains applied around requests and replies.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

/// Transforms a successful value; returning an error short-circuits into
/// the rejected arm of the remaining chain.
pub type Fulfilled<T> = Arc<dyn Fn(T) -> crate::Result<T> + Send + Sync>;
/// May recover from an error by producing a value.
pub type Rejected<T> = Arc<dyn Fn(Error) -> crate::Result<T> + Send + Sync>;

/// Token for removing an interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

struct Entry<T> {
    id: u64,
    fulfilled: Option<Fulfilled<T>>,
    rejected: Option<Rejected<T>>,
}

/// An ordered chain of interceptors over values of type `T`.
pub struct Interceptors<T> {
    entries: Mutex<Vec<Entry<T>>>,
    next_id: Mutex<u64>,
}

impl<T> Default for Interceptors<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Interceptors<T> {
    /// New, empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Append an interceptor with both arms optional.
    pub fn use_interceptor(
        &self,
        fulfilled: Option<Fulfilled<T>>,
        rejected: Option<Rejected<T>>,
    ) -> InterceptorId {
        let mut next_id = self.next_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.entries.lock().push(Entry {
            id,
            fulfilled,
            rejected,
        });
        InterceptorId(id)
    }

    /// Append a success-arm interceptor.
    pub fn use_fn(
        &self,
        fulfilled: impl Fn(T) -> crate::Result<T> + Send + Sync + 'static,
    ) -> InterceptorId {
        self.use_interceptor(Some(Arc::new(fulfilled)), None)
    }

    /// Remove an interceptor.
    pub fn eject(&self, id: InterceptorId) {
        self.entries.lock().retain(|entry| entry.id != id.0);
    }

    /// Number of installed interceptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fold `start` through the chain in registration order.
    pub fn run(&self, start: crate::Result<T>) -> crate::Result<T> {
        let entries: Vec<(Option<Fulfilled<T>>, Option<Rejected<T>>)> = self
            .entries
            .lock()
            .iter()
            .map(|entry| (entry.fulfilled.clone(), entry.rejected.clone()))
            .collect();
        let mut current = start;
        for (fulfilled, rejected) in entries {
            current = match current {
                Ok(value) => match fulfilled {
                    Some(fulfilled) => fulfilled(value),
                    None => Ok(value),
                },
                Err(error) => match rejected {
                    Some(rejected) => rejected(error),
                    None => Err(error),
                },
            };
        }
        current
    }
}

impl<T> Debug for Interceptors<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interceptors")
            .field("entries", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn chain_runs_in_order_and_ejects() {
        let chain: Interceptors<Vec<&'static str>> = Interceptors::new();
        chain.use_fn(|mut trail| {
            trail.push("first");
            Ok(trail)
        });
        let second = chain.use_fn(|mut trail| {
            trail.push("second");
            Ok(trail)
        });
        assert_eq!(chain.run(Ok(vec![])).expect("ok"), vec!["first", "second"]);

        chain.eject(second);
        assert_eq!(chain.run(Ok(vec![])).expect("ok"), vec!["first"]);
    }

    #[test]
    fn rejected_arm_can_recover() {
        let chain: Interceptors<u32> = Interceptors::new();
        chain.use_interceptor(
            None,
            Some(Arc::new(|error| {
                if error.code() == Some(ErrorCode::Timeout) {
                    Ok(0)
                } else {
                    Err(error)
                }
            })),
        );
        let recovered = chain.run(Err(Error::coded(ErrorCode::Timeout, "slow")));
        assert_eq!(recovered.expect("recovered"), 0);

        let passed = chain.run(Err(Error::coded(ErrorCode::RequestError, "boom")));
        assert!(passed.is_err());
    }

    #[test]
    fn fulfilled_error_reaches_later_rejected_arm() {
        let chain: Interceptors<u32> = Interceptors::new();
        chain.use_fn(|_| Err(Error::coded(ErrorCode::RequestError, "tainted")));
        chain.use_interceptor(None, Some(Arc::new(|_| Ok(99))));
        assert_eq!(chain.run(Ok(1)).expect("recovered"), 99);
    }
}
