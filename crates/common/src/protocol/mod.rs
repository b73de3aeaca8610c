pub mod validation;
pub mod ws;
