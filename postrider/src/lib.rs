pub mod bounce;
pub mod config;
pub mod master;
pub mod worker;

pub use bounce::DsnBounceHook;
pub use config::Config;
pub use master::{Master, MasterHandler};
pub use worker::{DeliveryHandler, DeliveryVerdict, Worker};
