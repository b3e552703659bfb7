//! Ports for load destinations and load observers.

use crate::domain::entities::{LoadedImage, WorkHandle};
use crate::domain::errors::LoadError;

/// Destination of a load, typically a view that displays the image.
///
/// Tasks hold targets weakly, a dropped target silently stops receiving
/// signals.
#[cfg_attr(test, mockall::automock)]
pub trait ImageTarget: Send + Sync {
    /// Receives the loaded image.
    fn set_image(&self, image: &LoadedImage);

    /// Receives the empty result of a request with nothing to load.
    fn set_empty(&self);

    /// Receives the final error of a failed load.
    fn set_failed(&self, _error: &LoadError) {}
}

/// Observes the lifecycle of a load.
///
/// Observers are notified in registration order: `on_error` once per failed
/// attempt, then `on_success` if the load produced an image, then
/// `on_finish` exactly once.
#[allow(unused_variables)]
pub trait LoadObserver: Send + Sync {
    /// Called for each error raised while loading.
    fn on_error(&self, error: &LoadError) {}

    /// Called when the image is available.
    fn on_success(&self, image: &LoadedImage) {}

    /// Called when the load ends, whatever the outcome.
    fn on_finish(&self, work: &WorkHandle) {}
}

/// Adapts a closure to [`LoadObserver::on_error`].
pub struct ErrorObserver<F>(pub F);

impl<F> LoadObserver for ErrorObserver<F>
where
    F: Fn(&LoadError) + Send + Sync,
{
    fn on_error(&self, error: &LoadError) {
        (self.0)(error);
    }
}

/// Adapts a closure to [`LoadObserver::on_success`].
pub struct SuccessObserver<F>(pub F);

impl<F> LoadObserver for SuccessObserver<F>
where
    F: Fn(&LoadedImage) + Send + Sync,
{
    fn on_success(&self, image: &LoadedImage) {
        (self.0)(image);
    }
}

/// Adapts a closure to [`LoadObserver::on_finish`].
pub struct FinishObserver<F>(pub F);

impl<F> LoadObserver for FinishObserver<F>
where
    F: Fn(&WorkHandle) + Send + Sync,
{
    fn on_finish(&self, work: &WorkHandle) {
        (self.0)(work);
    }
}
