use tracing::warn;
use tree_sitter::{Language, Parser};

/// Proposed file contents shorter than this with a code extension are
/// treated as an accidental wipe rather than an edit.
const MIN_CODE_LEN: usize = 10;

/// Extensions exempt from the wipe heuristic: short prose files are fine.
const PROSE_EXTENSIONS: &[&str] = &[".txt", ".md"];

/// Tree-based syntax gate for proposed edits.
///
/// For recognised languages the content is parsed and rejected when the
/// tree contains error or missing nodes. Unrecognised extensions always
/// validate; the gate must never block edits in languages it cannot
/// parse.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntaxValidator;

impl SyntaxValidator {
    pub fn new() -> Self {
        Self
    }

    fn language_for(extension: &str) -> Option<Language> {
        match extension {
            ".py" => Some(tree_sitter_python::LANGUAGE.into()),
            ".js" | ".jsx" | ".mjs" => Some(tree_sitter_javascript::LANGUAGE.into()),
            _ => None,
        }
    }

    /// True when `content` is structurally acceptable for a file with the
    /// given extension (dot included, e.g. `".py"`).
    pub fn validate_syntax(&self, content: &str, extension: &str) -> bool {
        if content.len() < MIN_CODE_LEN
            && !extension.is_empty()
            && !PROSE_EXTENSIONS.contains(&extension)
        {
            warn!(extension, len = content.len(), "proposed content is dangerously short");
            return false;
        }

        let Some(language) = Self::language_for(extension) else {
            return true;
        };

        let mut parser = Parser::new();
        if parser.set_language(&language).is_err() {
            // Grammar/runtime version mismatch: fail open, same as an
            // unrecognised language.
            return true;
        }

        match parser.parse(content, None) {
            Some(tree) => {
                let root = tree.root_node();
                !(root.has_error() || root.is_missing())
            }
            None => false,
        }
    }
}
