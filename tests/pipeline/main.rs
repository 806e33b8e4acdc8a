//! Pipeline integration tests against the in-memory cluster.


mod envelope;
mod groups;
mod ordering;
mod orders;
mod poison;
mod provisioning;

#[cfg(feature = "http")]
mod http;
