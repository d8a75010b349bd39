pub mod flow;
pub mod history;
pub mod target;
