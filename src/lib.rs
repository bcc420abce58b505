//! Offline access engine: licenses bound to (user, material, device), the
//! wrapped content keys they unlock, and the job queue that produces them.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod state;

pub mod crypto {
    pub mod aes;
    pub mod kek;
    pub mod nonce;
}

pub mod models {
    pub mod audit;
    pub mod cek;
    pub mod job;
    pub mod license;
}

pub mod repositories {
    pub mod cek;
    pub mod job;
    pub mod license;
    pub mod memory;
}

pub mod services {
    pub mod audit;
    pub mod job_queue;
    pub mod key_store;
    pub mod ledger;
    pub mod orchestrator;
    pub mod worker;
}

pub use error::{AppError, Result};
