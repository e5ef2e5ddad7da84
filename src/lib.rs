pub mod analyzer;
pub mod cancel;
pub mod case;
pub mod cli;
pub mod compare;
pub mod config;
pub mod error;
pub mod harness;
pub mod history;
pub mod logger;
pub mod normalize;
pub mod prioritize;
pub mod report;
pub mod runner;
pub mod scaffold;
