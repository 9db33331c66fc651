pub mod check;
pub mod introspect;
pub mod plan;
