// Master/worker process supervision core: signal-driven fleet control, a shared
// process table, and a peer-to-peer control channel mesh between sibling workers.
pub mod channel;
pub mod config;
pub mod master;
pub mod plugin;
pub mod signals;
pub mod table;
pub mod worker;
