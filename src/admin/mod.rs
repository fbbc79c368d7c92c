//! Administrative endpoints called by the game backend, guarded by the
//! shared admin secret.

pub mod notify;
pub mod presence;
