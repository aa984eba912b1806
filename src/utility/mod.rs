// defines macros, so must be included first
#[macro_use]
pub mod macros;
#[macro_use]
pub mod enum_passthrough;

pub mod callback_queue;
pub mod counter;

/// A trait we can use as a compile-time check to make sure that an object is Send.
pub trait IsSend: Send {}

/// A trait we can use as a compile-time check to make sure that an object is Sync.
pub trait IsSync: Sync {}
