pub mod queue;
#[cfg(test)]
mod tests;

pub use queue::{EventQueue, MessageHandler, QueueChannel};
