use serde::{Deserialize, Serialize};

use crate::layout::{FAST_SWITCH_MAX_OVERHEAD_FACTOR, FAST_SWITCH_MIN_CASE_COUNT};

/// Default nesting depth at which compilation reports a stack overflow.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 512;

/// Compilation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOptions {
    /// Emit `TraceEnter` / `TraceExit` calls around every function body.
    pub trace_calls: bool,
    /// AST nesting depth at which compilation fails with a stack overflow.
    pub max_recursion_depth: usize,
    /// Largest `span / case_count` ratio for which a switch uses a jump table.
    pub fast_switch_max_overhead: usize,
    /// Fewest cases for which a switch uses a jump table.
    pub fast_switch_min_cases: usize,
    /// The code runs as an eval program: declarations go through the runtime.
    pub is_eval: bool,
    /// Name reported in diagnostics.
    pub source_name: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            trace_calls: false,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            fast_switch_max_overhead: FAST_SWITCH_MAX_OVERHEAD_FACTOR,
            fast_switch_min_cases: FAST_SWITCH_MIN_CASE_COUNT,
            is_eval: false,
            source_name: "<anonymous>".to_string(),
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_trace_calls(mut self, enabled: bool) -> Self {
        self.trace_calls = enabled;
        self
    }

    #[must_use]
    pub fn with_max_recursion_depth(mut self, depth: usize) -> Self {
        self.max_recursion_depth = depth;
        self
    }

    #[must_use]
    pub fn with_fast_switch(mut self, max_overhead: usize, min_cases: usize) -> Self {
        self.fast_switch_max_overhead = max_overhead;
        self.fast_switch_min_cases = min_cases;
        self
    }

    #[must_use]
    pub fn with_eval(mut self, is_eval: bool) -> Self {
        self.is_eval = is_eval;
        self
    }

    #[must_use]
    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = CompileOptions::default();
        assert!(!options.trace_calls);
        assert_eq!(options.max_recursion_depth, 512);
        assert_eq!(options.fast_switch_max_overhead, 10);
        assert_eq!(options.fast_switch_min_cases, 5);
    }

    #[test]
    fn test_builder_chain() {
        let options = CompileOptions::new()
            .with_trace_calls(true)
            .with_fast_switch(4, 3)
            .with_source_name("t.js");
        assert!(options.trace_calls);
        assert_eq!(options.fast_switch_max_overhead, 4);
        assert_eq!(options.fast_switch_min_cases, 3);
        assert_eq!(options.source_name, "t.js");
    }
}
