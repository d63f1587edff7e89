pub(crate) mod chain;
pub(crate) mod constants;
pub(crate) mod error;
pub(crate) mod time;
