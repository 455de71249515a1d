pub mod database;
pub mod inventory_store;
pub mod logger;
pub mod migrations;
pub mod preview;
pub mod provider_manager;
pub mod reconciliation;
pub mod retirement;
pub mod settings;
pub mod terminator;
