//! End-to-end scenarios run against [crate::bucket::InMemoryStorageServer]
//! rather than any single module's unit tests.

mod scenarios;
