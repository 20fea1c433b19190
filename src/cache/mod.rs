pub mod typing;

pub use typing::TypingCache;
