//! Domain models shared by the supervisor, the registry, and the control surface.

pub mod account;
pub mod worker;
