//! Compilation tuning knobs.

/// Thresholds shared by the compiler, the inline-cache engine and the
/// bailout machinery. One instance lives in the [`crate::pipeline::Jit`]
/// and is passed by reference everywhere; nothing reads ambient state.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Stubs a cache site may accumulate before going megamorphic.
    pub max_stubs: u32,
    /// Misses without a successful stub attachment before a site disables
    /// itself.
    pub max_failed_updates: u32,
    /// Bailouts of one kind a compiled unit tolerates before it is
    /// invalidated and recompiled without the failing speculation.
    pub bailout_threshold: u32,
    /// Failed compilation attempts before a script is excluded from this
    /// tier.
    pub max_compile_aborts: u32,
}

impl Default for CompileOptions {
    fn default() -> CompileOptions {
        CompileOptions {
            max_stubs: 16,
            max_failed_updates: 16,
            bailout_threshold: 10,
            max_compile_aborts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let opts = CompileOptions::default();
        assert_eq!(opts.max_stubs, 16);
        assert_eq!(opts.max_failed_updates, 16);
    }
}
