pub mod backend;
pub mod command;
pub mod compare;
pub mod i18n;
pub mod paths;
pub mod plan;
pub mod replay;
pub mod report;
pub mod results;
pub mod scheduler;
pub mod types;
pub mod work;
