//! Transports implementing [`Communicator`](crate::comm::Communicator).

pub mod local;

pub use local::{LocalCluster, LocalComm};
