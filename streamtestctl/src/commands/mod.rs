pub mod check;
pub mod geo;
