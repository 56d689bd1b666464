pub mod attachments;
pub mod config;
pub mod draft;
pub mod external;
pub mod identity;
pub mod issues;
pub mod matchers;
pub mod metadata;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod resolver;
pub mod rewriter;
pub mod runtime;
pub mod sanitize;
pub mod scanner;
pub mod storage;
