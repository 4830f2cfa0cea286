pub mod image;
pub mod text;
pub mod voice;
