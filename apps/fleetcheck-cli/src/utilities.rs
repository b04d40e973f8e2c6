pub mod identifiers;
pub mod json;
pub mod retry;
pub mod units;
