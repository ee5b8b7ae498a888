//! Extension points for collaborators that live outside this crate
//!
//! - **CreditGate**: balance checks and charging for billable features

mod credit_gate;

pub use credit_gate::{CreditError, CreditGate, GENERATION_FEATURE, NoOpCreditGate};
