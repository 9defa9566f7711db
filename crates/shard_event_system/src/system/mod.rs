/// Event system module - registry, dispatcher and completion handles
mod completion;
mod core;
mod emitters;
mod handlers;
mod registry;
mod stats;
#[cfg(test)]
mod tests;

// Re-export all public items from submodules
pub use completion::Completion;
pub use core::EventSystem;
pub use handlers::{HandlerDecl, Listener, ListenerHandler, ListenerId, ParamType};
pub use registry::HandlerRegistry;
pub use stats::EventSystemStats;
