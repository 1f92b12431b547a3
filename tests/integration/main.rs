mod common;

mod delegation_test;
mod gate_test;
mod health_test;
mod quota_test;
mod session_test;
