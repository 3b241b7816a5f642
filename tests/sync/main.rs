// Integration tests for replica synchronization
// Each module drives real sessions over temporary replica roots

mod common;

mod conflict_tests;
mod failure_tests;
mod filter_tests;
mod session_tests;
mod store_tests;
