//! Maintenance and repair streams for the tag cache.
//!
//! Every operation here is a [`Stream`](futures::Stream) of progress events
//! over a [`TagCache`](tagmap_cache::TagCache), so a caller can report
//! progress, stop early, and pick up where it left off:
//! - [`regenerate`] / [`resume`]: checkpointed chain regeneration, one
//!   committed chunk at a time.
//! - [`sweep`]: a consistency check that quarantines whatever disagrees with
//!   a rebuild.
//! - [`recover`]: regeneration of every quarantined scope.

pub mod error;
mod regen;
mod sweep;

pub use self::regen::{RegenEvent, regenerate, resume};
pub use self::sweep::{RecoverEvent, SweepEvent, recover, sweep};
