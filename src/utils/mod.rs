#[cfg(feature = "reqwest")]
pub(crate) mod reader;
