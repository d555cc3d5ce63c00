//! Cooperative cancellation.
//!
//! A user-initiated abort stops the run at the next stage boundary or inside
//! a bounded wait. External side effects are left as the external system
//! reports them; no cleanup is attempted.

mod token;

pub use token::CancellationToken;
