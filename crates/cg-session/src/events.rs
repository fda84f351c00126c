//! Session lifecycle notifications
//!
//! The manager publishes these on a broadcast channel. Navigation (e.g. back
//! to a login screen) is the subscriber's job.

/// Why a session was cleared
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// `logout()` called by the application
    Requested,
    /// The refresh endpoint rejected the refresh token, or there was none
    RefreshFailed,
    /// A request stayed unauthorized with no way to recover
    Unauthorized,
    /// The stored token could not be used to load the user profile
    ProfileUnavailable,
    /// The session could not be written to the store
    StoreUnavailable,
}

/// A change in session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    TokenRefreshed,
    LoggedOut(LogoutReason),
    /// The caller must re-authenticate
    SessionExpired,
}

/// Capacity of the event channel; slow subscribers see `Lagged`
pub(crate) const EVENT_CAPACITY: usize = 32;
