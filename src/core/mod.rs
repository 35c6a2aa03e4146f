//! # Core Protocol Components
//!
//! Framing, the dynamic value model and object identity.
//!
//! ## Components
//! - **Packet**: binary packet format with magic bytes and a length prefix
//! - **Codec**: tokio codec for framing over byte streams
//! - **Value**: values crossing the boundary by copy or by reference
//! - **Object**: the hosting trait and explicit capability tables
//! - **Identity**: the stable name of an object crossing by reference
//!
//! ## Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Flags(1)] [Length(4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum packet size: 16MB (prevents memory exhaustion)
//! - Magic bytes prevent accidental misinterpretation
//! - Length validation before allocation

pub mod codec;
pub mod identity;
pub mod object;
pub mod packet;
pub mod value;
