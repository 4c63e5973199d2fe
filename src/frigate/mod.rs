pub mod client;
pub mod event;

pub use client::{EventSource, FrigateClient};
pub use event::Event;
