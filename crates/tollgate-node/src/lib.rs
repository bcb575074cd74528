//! Tollgate host node
//!
//! Configuration, the RocksDB session store, the funding detector, the HTTP
//! API and the orchestrator that runs them on top of `tollgate-session`.

pub mod api;
pub mod config;
pub mod funding;
pub mod node;
pub mod state;
pub mod storage;

pub use config::TollgateConfig;
pub use funding::FundingDetector;
pub use node::TollgateNode;
pub use storage::RocksStore;
