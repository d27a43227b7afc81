//! Memory management module for GG-CACHE.
//!
//! Provides the block arena that backs resident models and the session
//! tracker that bounds concurrent logical sessions against a memory budget.

mod arena;
mod session;

pub use arena::{
    Allocation, Arena, ArenaConfig, ArenaError, ArenaStats, BlockSnapshot, DEFAULT_ALIGNMENT,
};
pub use session::{
    SessionConfig, SessionContext, SessionError, SessionHandle, SessionManager, SessionStats,
};
