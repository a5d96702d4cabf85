// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! business-ledger
//!
//! Facade over the workspace crates. Depend on the individual `ubl-*`
//! crates for a narrow surface, or on this crate to get the whole ledger
//! core at once.

pub use ubl_aggregate;
pub use ubl_authz;
pub use ubl_core;
pub use ubl_domain;
pub use ubl_projection;
pub use ubl_realm;
pub use ubl_runtime;
pub use ubl_saga;
pub use ubl_schema;
pub use ubl_scheduler;
pub use ubl_store;
pub use ubl_workflow;

pub use ubl_runtime::LedgerRuntime;
