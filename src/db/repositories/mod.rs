pub mod session;
pub mod timer;
pub mod user;
