mod common;
mod concurrency;
mod kernel;
mod lifecycle;
mod scenarios;
