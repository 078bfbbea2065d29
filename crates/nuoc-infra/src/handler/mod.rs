//! Task handlers shipped with the engine.

pub mod command;

pub use command::{COMMAND_HANDLER, CommandHandler};

use nuoc_core::workflow::handler::HandlerRegistry;

/// A registry holding every built-in handler.
pub fn builtin_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register(COMMAND_HANDLER, CommandHandler::default());
    handlers
}
