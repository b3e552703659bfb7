//! Use case implementations.

mod dispatch;

pub use dispatch::ImageDispatcher;
