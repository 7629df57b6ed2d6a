pub mod running;
pub mod testcase;
