pub mod abi;
pub mod accounts;
pub mod cache;
pub mod chain;
pub mod cheatcodes;
pub mod config;
pub mod contracts;
pub mod corpus;
pub mod coverage;
pub mod fork;
pub mod fuzzer;
pub mod logger;
pub mod mutator;
pub mod reverts;
pub mod rpc;
pub mod sequence;
pub mod shrink;
pub mod testcase;
pub mod types;
pub mod worker;
