//! Error handling utilities for the VeldDB engine

use thiserror::Error;

/// The main error type for the VeldDB engine
#[derive(Error, Debug, Clone)]
pub enum VeldError {
    #[error("Parse error: {message}")]
    ParseError { message: String },

    #[error("Plan error: {message}")]
    PlanError { message: String },

    #[error("Type error: {message}")]
    TypeError { message: String },

    #[error("IR error: {message}")]
    IrError { message: String },

    #[error("Register allocation error: {message}")]
    RegAllocError { message: String },

    #[error("Code generation error: {message}")]
    CodegenError { message: String },

    #[error("Catalog error: {message}")]
    CatalogError { message: String },

    #[error("I/O error: {message}")]
    IoError { message: String },

    #[error("Execution error: {message}")]
    ExecError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },
}

/// Result type alias for VeldDB operations
pub type VeldResult<T> = Result<T, VeldError>;

impl VeldError {
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::ParseError { message: message.into() }
    }

    pub fn plan_error(message: impl Into<String>) -> Self {
        Self::PlanError { message: message.into() }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::TypeError { message: message.into() }
    }

    pub fn ir_error(message: impl Into<String>) -> Self {
        Self::IrError { message: message.into() }
    }

    pub fn reg_alloc_error(message: impl Into<String>) -> Self {
        Self::RegAllocError { message: message.into() }
    }

    pub fn codegen_error(message: impl Into<String>) -> Self {
        Self::CodegenError { message: message.into() }
    }

    pub fn catalog_error(message: impl Into<String>) -> Self {
        Self::CatalogError { message: message.into() }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::IoError { message: message.into() }
    }

    pub fn exec_error(message: impl Into<String>) -> Self {
        Self::ExecError { message: message.into() }
    }

    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError { message: message.into() }
    }
}

impl From<std::io::Error> for VeldError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError { message: e.to_string() }
    }
}
