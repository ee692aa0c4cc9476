pub mod connection;
pub mod gossip;
pub mod registry;
pub mod topic;
