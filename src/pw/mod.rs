pub mod build_info;
pub mod cli;
pub mod logger;
pub mod options;
pub mod process;
pub mod rpc;
pub mod signals;
pub mod supervisor;
pub mod timers;
pub mod web;
