//! Transport-level clients, one per provider shape: a token stream for text,
//! a request/response connection for images, a duplex session for voice.

pub mod image;
pub mod text;
pub mod voice;
