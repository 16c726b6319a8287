
#[allow(dead_code)]
#[path = "../../memory/support/workflows/mod.rs"]
pub mod workflows;
