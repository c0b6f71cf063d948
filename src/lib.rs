pub mod db;
pub mod live_object;
pub mod rpc;
pub mod types;
