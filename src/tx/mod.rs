pub mod builder;
pub mod selector;
pub mod signer;
