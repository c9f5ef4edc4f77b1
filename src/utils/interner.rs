//! Global String Interner
//!
//! Maps shader source names and define keys to compact integer [`Symbol`]s
//! so variant keys hash and compare as integers.

use std::sync::LazyLock;

use lasso::{Spur, ThreadedRodeo};

static INTERNER: LazyLock<ThreadedRodeo> = LazyLock::new(ThreadedRodeo::new);

/// Compact integer identifier for an interned string.
pub type Symbol = Spur;

/// Interns a string, returning the existing symbol if already present.
#[inline]
pub fn intern(s: &str) -> Symbol {
    INTERNER.get_or_intern(s)
}

/// Looks up a symbol without interning.
#[inline]
pub fn get(s: &str) -> Option<Symbol> {
    INTERNER.get(s)
}

/// Resolves a symbol back to its string.
#[inline]
pub fn resolve(sym: Symbol) -> &'static str {
    INTERNER.resolve(&sym)
}

/// Pre-interns the built-in shader names and key properties so the first
/// frame does not pay for it on the hot path.
pub fn preload_builtin_names() {
    for name in crate::shader::BUILTIN_SHADERS {
        intern(name);
    }
    for name in crate::shader::key::ShaderKeyProperties::get().property_names() {
        intern(name);
    }
}
