//! Static and semi-static analysis components (C3, C4, C5): AST rules, plan
//! shape rules, and catalog/DMV checks, fanned out and merged by the review
//! orchestrator (C6).

pub mod ast;
pub mod best_practices;
pub mod metadata;
pub mod orchestrator;
pub mod plan;

pub use ast::AstAnalyzer;
pub use metadata::MetadataAnalyzer;
pub use orchestrator::ReviewOrchestrator;
pub use plan::PlanAnalyzer;
