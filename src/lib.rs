#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod config;
pub mod convergence;
pub mod epub;
pub mod error;
pub mod generation;
pub mod logging;
pub mod manuscript;
pub mod openai;
pub mod parse;
pub mod phases;
pub mod pipeline;
pub mod progress;
pub mod project;
pub mod publish;
pub mod quality;
pub mod store;
pub mod structure;
pub mod wordcount;
