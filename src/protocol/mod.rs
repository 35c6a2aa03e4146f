//! # Remote-Object Protocol
//!
//! Values crossing a connection, the references they create, and the
//! request/reply session that carries them.
//!
//! ## Components
//! - **Message**: wire messages and the boxed value encoding
//! - **Boxing**: value to wire and back, creating references as needed
//! - **Registry**: local object table and per-connection proxy cache
//! - **Connection**: synchronous requests with a nested serve loop
//! - **Dispatcher**: executes incoming requests, recovering every failure
//! - **Capability**: discovery of the invokable operations of an object
//!
//! ## Reference lifetime
//! Every object boxed by reference gains one peer reference in the sender's
//! local object table. The receiver's proxy accumulates the same count and
//! returns it in a single decref when its last handle drops.

pub mod boxing;
pub mod capability;
pub mod connection;
pub mod dispatcher;
pub mod message;
pub mod registry;

#[cfg(test)]
mod tests;
