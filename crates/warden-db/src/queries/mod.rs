//! Query modules, one per table family.

pub mod events;
pub mod outbox;
pub mod tasks;
pub mod workflows;
pub mod world;
