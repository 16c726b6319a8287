//! Test support shared by flowstate's database-backed test suites.

pub mod db;
