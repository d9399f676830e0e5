pub mod job;
pub mod matching;
pub mod wine;
