//! Call sessions and the in-memory session store
//!
//! A [`CallSession`] is created once at `start_call`, owned by its
//! orchestrator task for the call's lifetime, and evicted from the
//! [`SessionStore`] after the final persistence flush. Session ids are never
//! reused or re-inserted.

pub mod session;
pub mod store;

pub use session::CallSession;
pub use store::{SessionStore, SessionStoreStats};
