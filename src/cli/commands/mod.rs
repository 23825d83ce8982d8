mod users;

pub use users::*;
