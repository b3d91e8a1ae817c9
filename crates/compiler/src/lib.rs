//! Lexer and single-pass parser/codegen for the AQL language (spec §4.C,
//! §4.D). Consumes source text, produces a single main-chunk [`aql_core::Proto`].

pub mod expdesc;
pub mod funcstate;
pub mod lexer;
pub mod parser;
pub mod token;

pub use expdesc::{ExpDesc, ExpKind};
pub use funcstate::FuncState;
pub use lexer::Lexer;
pub use parser::Parser;
pub use token::{Token, TokenKind};

/// Compile a whole source string into a main-chunk [`aql_core::Proto`]
/// (the embedding API's `aql_load` entry point, spec §6).
pub fn compile(source_name: impl Into<String>, source: &str) -> Result<aql_core::Proto, aql_core::AqlError> {
    Parser::new(source_name, source)?.parse_chunk()
}
