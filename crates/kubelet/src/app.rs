//! Daemon wiring: building the kubelet from command line arguments and running its loops.

pub mod builder;
pub mod core;
pub mod tasks;

pub use self::builder::ApplicationBuilder;
pub use self::core::Application;
