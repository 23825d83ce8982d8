pub use super::sessions::Entity as Sessions;
pub use super::timers::Entity as Timers;
pub use super::users::Entity as Users;
