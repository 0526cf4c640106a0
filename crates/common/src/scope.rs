//! Request and batch scopes.
//!
//! A [`Scope`] carries the ambient values of one inbound event (its
//! [`BindingContext`]) together with the resources acquired on its behalf
//! ([`ResourceScope`]). Code running inside [`Scope::run`] can read both
//! through [`current`] without the values being threaded through every call.

mod bindings;
mod context;
mod error;
mod factory;
mod resources;

pub use bindings::*;
pub use context::*;
pub use error::*;
pub use factory::*;
pub use resources::*;
