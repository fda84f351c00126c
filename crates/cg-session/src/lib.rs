//! cg-session: CampusGo client session library
//!
//! Keeps the access/refresh token pair and the logged-in user's profile,
//! persists them to a key-value store, and attaches the access token to API
//! requests, refreshing it when it expires.

pub mod claims;
pub mod events;
pub mod manager;
pub mod store;
pub mod transport;
pub mod types;

pub use events::{LogoutReason, SessionEvent};
pub use manager::SessionManager;
pub use store::{KeyValueStore, MemoryStore, SqliteStore, StorageKeys};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Transport};
pub use types::{Credentials, Session, TokenResponse, UserProfile};
