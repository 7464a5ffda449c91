pub mod evaluation;
pub mod signal;
pub mod ss;
