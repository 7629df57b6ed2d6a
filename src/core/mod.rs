pub mod domain;
pub mod meta;
pub mod pipeline;
pub mod results;
pub mod traits;
pub mod verdict;
