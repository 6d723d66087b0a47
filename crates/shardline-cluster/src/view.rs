//! Read-only projections of a watched value.
//!
//! A `View` shares the underlying `watch::Receiver` with every other view
//! of the same source; projecting never copies the source into a separate
//! channel, so all views agree on what the current value is.

use std::sync::Arc;

use tokio::sync::watch;

pub struct View<S, T> {
    rx: watch::Receiver<S>,
    project: Arc<dyn Fn(&S) -> T + Send + Sync>,
}

impl<S, T> Clone for View<S, T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
            project: Arc::clone(&self.project),
        }
    }
}

impl<S: 'static, T: 'static> View<S, T> {
    pub fn new(rx: watch::Receiver<S>, project: impl Fn(&S) -> T + Send + Sync + 'static) -> Self {
        Self {
            rx,
            project: Arc::new(project),
        }
    }

    /// Project the current source value.
    pub fn get(&self) -> T {
        (self.project)(&self.rx.borrow())
    }

    /// Project the current value and mark it seen.
    pub fn get_and_update(&mut self) -> T {
        (self.project)(&self.rx.borrow_and_update())
    }

    /// Wait until the source changes. Returns false once the source is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// A narrower view over the same source.
    pub fn subview<U: 'static>(&self, f: impl Fn(&T) -> U + Send + Sync + 'static) -> View<S, U> {
        let project = Arc::clone(&self.project);
        View::new(self.rx.clone(), move |s| f(&project(s)))
    }
}
