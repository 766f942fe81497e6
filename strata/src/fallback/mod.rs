//! Generic point-to-point collectives.
//!
//! These make no topology assumptions and work on any [`Communicator`].
//! The engine delegates to them for small groups, unsupported inputs and
//! plans that elect a flat algorithm; the hierarchical phases reuse them on
//! sub-communicators.
//!
//! [`Communicator`]: crate::comm::Communicator

mod allgather;
mod allreduce;
mod barrier;
mod broadcast;
pub(crate) mod helpers;

pub(crate) use allgather::allgather;
pub(crate) use allreduce::{recursive_doubling_allreduce, rsag_allreduce};
pub(crate) use barrier::barrier;
pub(crate) use broadcast::{knomial_broadcast, linear_broadcast};
