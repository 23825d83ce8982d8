pub mod prelude;

pub mod sessions;
pub mod timers;
pub mod users;
