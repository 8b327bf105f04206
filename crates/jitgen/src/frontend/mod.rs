//! Source frontend: turns script text into a resolved [`FunctionLiteral`].
//!
//! The pipeline is [`lexer`] → [`parser`] → [`resolver`]. Only the last stage
//! knows about slots; the parser produces a plain syntax tree.

mod lexer;
mod parser;
mod resolver;
mod syntax;

use crate::ast::{FunctionLiteral, ScopeKind};
use crate::{Error, Result};

/// Parses and resolves a global or eval program.
pub fn parse_program(source: &str, kind: ScopeKind) -> Result<FunctionLiteral> {
    if kind == ScopeKind::Function {
        return Err(Error::Resolve(
            "only global and eval programs can be parsed".to_string(),
        ));
    }
    let tokens = lexer::Lexer::new(source).scan_tokens()?;
    tracing::trace!(tokens = tokens.len(), "scanned");
    let program = parser::Parser::new(tokens).parse()?;
    let literal = resolver::resolve(&program, kind)?;
    tracing::debug!(
        declarations = literal.scope.declarations.len(),
        stack_slots = literal.scope.num_stack_slots,
        heap_slots = literal.scope.num_heap_slots,
        "resolved program"
    );
    Ok(literal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_program_rejects_function_scope() {
        assert!(matches!(
            parse_program("1", ScopeKind::Function),
            Err(Error::Resolve(_))
        ));
    }

    #[test]
    fn test_syntax_errors_surface() {
        assert!(matches!(
            parse_program("var = 1;", ScopeKind::Global),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_program_positions() {
        let program = parse_program("function f() {}\nf();", ScopeKind::Global).unwrap();
        assert_eq!(program.start_position, 0);
        let f = program.scope.declarations[0].function.as_ref().unwrap();
        assert_eq!(f.start_position, 0);
        assert_eq!(f.end_position, 15);
        assert_eq!(f.name, "f");
    }
}
