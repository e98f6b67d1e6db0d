pub mod database;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod payout;
pub mod repository;
pub mod settlement;

pub use gateway::GatewayClient;
pub use ledger::EscrowLedger;
pub use payout::PayoutProcessor;
pub use repository::{DynRepository, MemoryRepository, Repository};
