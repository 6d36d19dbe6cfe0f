//! Continuous stream-table join of order-line events against the product
//! reference catalog.

pub mod blob;
pub mod config;
pub mod error;
pub mod reference;
pub mod worker;
