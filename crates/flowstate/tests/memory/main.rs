//! Integration tests against the in-memory store.

mod e2e;
mod store;
