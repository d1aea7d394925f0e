//! Component data model consumed by the kernel.
//!
//! # Responsibility
//! - Define the inbound registration record and the immutable descriptor
//!   built from it.
//! - Define the type-erased instance model shared by handlers, lifestyles
//!   and the release policy.
//!
//! # Invariants
//! - Descriptors are immutable after registration.
//! - Dependency lists hold identifiers, never instance references.

pub mod descriptor;
pub mod instance;
