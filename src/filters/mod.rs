//! Operator module.
//!
//! Contains the operator registry and built-in kernel implementations.

pub mod registry;
pub mod builtin;

pub use registry::{Category, OperatorFactory, OperatorInfo, OperatorParams, OperatorRegistry};
