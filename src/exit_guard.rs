//! Scope-exit callback, standing in for [`scopeguard`](https://crates.io/crates/scopeguard).

/// Invokes the stored closure over the captured value when the scope ends, including on early
/// return.
pub(crate) struct ExitGuard<T, F: FnOnce(&mut T)> {
    captured: T,
    on_exit: Option<F>,
}

impl<T, F: FnOnce(&mut T)> ExitGuard<T, F> {
    #[inline]
    pub(crate) fn new(captured: T, on_exit: F) -> Self {
        Self {
            captured,
            on_exit: Some(on_exit),
        }
    }
}

impl<T, F: FnOnce(&mut T)> Drop for ExitGuard<T, F> {
    #[inline]
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit(&mut self.captured);
        }
    }
}
