pub mod auth_service;
pub use auth_service::{AuthError, AuthService, LoginResult, UserInfo};

pub mod auth_service_impl;
pub use auth_service_impl::DefaultAuthService;

pub mod credentials;
pub use credentials::CredentialStore;

pub mod sessions;
pub use sessions::SessionManager;

pub mod timer_engine;
pub use timer_engine::{AllTimers, TimerEngine, TimerError, TimerFilter};

pub mod sync;
pub use sync::{Subscription, SubscriptionRegistry, SyncMessage, SyncService, TickReport};
