use std::collections::VecDeque;

/// Decision returned by a [`Observable::notify_keep`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keep {
    Keep,
    Remove,
}

/// An ordered list of observer tokens with notification primitives that
/// stay well-defined while the list is being modified.
///
/// Two notification styles are supported:
///
/// - [`notify_keep`] visits every token in subscription order; the callback
///   decides per token whether it stays subscribed.
/// - [`notify_remove_all`] removes each token from the list immediately
///   before its callback, so tokens re-subscribed during the dispatch (via
///   [`subscribe`] on the same list, once the borrow allows) are picked up
///   by the *next* dispatch, not the current one.
///
/// The send-retry path and driver-state observers use this to requeue
/// connections without risking skipped or doubled notifications.
///
/// [`notify_keep`]: #method.notify_keep
/// [`notify_remove_all`]: #method.notify_remove_all
/// [`subscribe`]: #method.subscribe
#[derive(Debug)]
pub struct Observable<K> {
    observers: VecDeque<K>,
}

impl<K: Copy + PartialEq> Observable<K> {
    pub const fn new() -> Observable<K> {
        Observable {
            observers: VecDeque::new(),
        }
    }

    pub fn has_observers(&self) -> bool {
        !self.observers.is_empty()
    }

    pub fn is_subscribed(&self, token: &K) -> bool {
        self.observers.contains(token)
    }

    /// Append `token` unless already present.
    pub fn subscribe(&mut self, token: K) {
        if !self.is_subscribed(&token) {
            self.observers.push_back(token);
        }
    }

    /// Remove `token` if present.
    pub fn unsubscribe(&mut self, token: &K) {
        self.observers.retain(|t| t != token);
    }

    pub fn clear(&mut self) {
        self.observers.clear();
    }

    /// Visit every token in order; the callback decides which stay.
    pub fn notify_keep<F>(&mut self, mut f: F)
    where
        F: FnMut(K) -> Keep,
    {
        let mut idx = 0;
        while idx < self.observers.len() {
            match f(self.observers[idx]) {
                Keep::Keep => idx += 1,
                Keep::Remove => {
                    self.observers.remove(idx);
                }
            }
        }
    }

    /// Remove each token immediately before its callback runs.
    pub fn notify_remove_all<F>(&mut self, mut f: F)
    where
        F: FnMut(K),
    {
        while let Some(token) = self.observers.pop_front() {
            f(token);
        }
    }

    /// Detach the current observer list for out-of-band dispatch.
    ///
    /// Leaves the list empty, so dispatch code may re-subscribe tokens into
    /// it while iterating the returned queue.
    pub fn take_all(&mut self) -> VecDeque<K> {
        core::mem::take(&mut self.observers)
    }
}

impl<K: Copy + PartialEq> Default for Observable<K> {
    fn default() -> Self {
        Observable::new()
    }
}
