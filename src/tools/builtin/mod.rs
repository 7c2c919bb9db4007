//! Built-in tools.

pub mod connector;
pub mod report;
pub mod web;

pub use connector::HttpConnectorTool;
pub use report::ReportSaveTool;
pub use web::{ScrapeTool, WebSearchTool};
