//! Library crate for optic-poll-rs: batch SNMP/ICMP polling of switch
//! liveness, uptime and SFP optical levels.
pub mod config;
pub mod error;
pub mod health;
pub mod interfaces;
pub mod inventory;
pub mod mib;
pub mod net;
pub mod normalize;
pub mod oid;
pub mod pipeline;
pub mod probe;
pub mod resolver;
pub mod scheduler;
pub mod server;
pub mod sink;
pub mod types;
pub mod vendor;
